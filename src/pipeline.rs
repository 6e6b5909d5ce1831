//! One extraction run, stage by stage.
//!
//! A run is a handful of tasks joined by channels:
//!
//! - **ingest** reads chunks whenever the [`Coordinator`] allows it and
//!   feeds them to the [`Demuxer`]. The track descriptor goes out over a
//!   oneshot channel and sample batches over an unbounded channel whose
//!   depth the coordinator tracks.
//! - **submit** hands samples to the [`DecoderAdapter`] as its queue
//!   drains.
//! - the **driver** (this module's [`run`]) receives decoded frames, asks the
//!   [`FrameSampler`] about each one, and starts a persist task per kept
//!   frame. Persist tasks encode concurrently but save in turn, so frames
//!   reach the store in timestamp order. The driver is the only writer of
//!   the sampler and the progress counters.
//!
//! Whatever ends the run, [`run`] tears every stage down before returning.

use std::{collections::VecDeque, path::PathBuf, sync::Arc};

use tokio::{
    sync::{mpsc, oneshot},
    task::{JoinError, JoinHandle, JoinSet},
};

use crate::{
    configuration::{ExtractionConfig, OutputFormat, PipelineLimits},
    coordinator::{Coordinator, FrameSlot},
    decoder::{DecodedFrame, DecoderAdapter, DecoderBackend, SampleSubmitter},
    demux::{DemuxEvent, Demuxer, SampleRecord, TrackDescriptor},
    encode::encode_frame,
    error::ExtractError,
    progress::{CancellationToken, FramePreview, ProgressTracker},
    sampling::{FrameSampler, SampleDecision, estimate_kept_frames},
    source::ChunkedReader,
    store::{ExtractedFrame, FrameStore, SessionId},
};

/// Everything a run needs, owned by the run.
pub(crate) struct Job {
    pub session: SessionId,
    pub path: PathBuf,
    pub config: ExtractionConfig,
    pub limits: PipelineLimits,
    pub store: Arc<dyn FrameStore>,
    pub backend: Arc<dyn DecoderBackend>,
    pub preview: Option<Arc<dyn FramePreview>>,
    pub token: CancellationToken,
}

type Persisting = JoinHandle<Result<ExtractedFrame, ExtractError>>;

/// Run `job` to its end, publishing progress through `tracker`.
///
/// Returns `Err(ExtractError::Cancelled)` when the job's token fires. The
/// caller turns the outcome into the final state.
pub(crate) async fn run(job: Job, tracker: &mut ProgressTracker) -> Result<(), ExtractError> {
    let mut run = Run {
        coordinator: Coordinator::new(&job.limits),
        job,
        stages: JoinSet::new(),
        decoder: None,
        persisting: VecDeque::new(),
    };
    let result = run.drive(tracker).await;
    run.teardown().await;
    result
}

struct Run {
    job: Job,
    coordinator: Coordinator,
    stages: JoinSet<Result<(), ExtractError>>,
    decoder: Option<DecoderAdapter>,
    persisting: VecDeque<Persisting>,
}

impl Run {
    async fn drive(&mut self, tracker: &mut ProgressTracker) -> Result<(), ExtractError> {
        let token = self.job.token.clone();
        let reader = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ExtractError::Cancelled),
            reader = ChunkedReader::open(&self.job.path, self.job.limits.chunk_size) => reader?,
        };
        log::debug!("Opened {} ({} bytes)", self.job.path.display(), reader.len());

        let (track_sender, mut track_receiver) = oneshot::channel();
        let (sample_sender, sample_receiver) = mpsc::unbounded_channel();
        let demuxer = Demuxer::new(reader.len(), self.job.limits.samples_per_batch);
        self.stages.spawn(ingest(
            reader,
            demuxer,
            self.coordinator.clone(),
            token.clone(),
            track_sender,
            sample_sender,
        ));

        let track = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ExtractError::Cancelled),
            track = &mut track_receiver => match track {
                Ok(track) => track,
                Err(_) => {
                    // Ingest ended before finding a track; surface its error.
                    while let Some(joined) = self.stages.join_next().await {
                        stage_result(joined)?;
                    }
                    return Err(ExtractError::NoVideoTrack);
                }
            },
        };

        let total = estimate_kept_frames(track.duration_seconds(), &self.job.config);
        log::info!(
            "Found {} track {}x{}, {} samples over {:.2}s; expecting about {total} frames",
            track.codec_string,
            track.width,
            track.height,
            track.sample_count,
            track.duration_seconds()
        );
        tracker.set_total(total);

        let (decoder, submitter, mut frames) = DecoderAdapter::spawn(
            Arc::clone(&self.job.backend),
            track,
            self.coordinator.clone(),
            token.clone(),
            self.job.limits.max_frames_in_flight,
        );
        self.decoder = Some(decoder);
        self.stages
            .spawn(submit(sample_receiver, submitter, token.clone()));

        let mut sampler = FrameSampler::new(&self.job.config);
        let (first_turn, mut turn) = oneshot::channel();
        let _ = first_turn.send(());
        let mut decoding = true;

        while decoding || !self.persisting.is_empty() {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ExtractError::Cancelled),
                Some(joined) = self.stages.join_next(), if !self.stages.is_empty() => {
                    stage_result(joined)?;
                }
                Some(persisted) = next_persisted(&mut self.persisting), if !self.persisting.is_empty() => {
                    let persisted = persisted.map_err(join_error)?;
                    self.report(persisted, tracker)?;
                }
                frame = frames.recv(), if decoding => match frame {
                    Some(Ok(frame)) => match sampler.decide(frame.timestamp) {
                        SampleDecision::Keep => {
                            log::trace!("Keeping frame at {:.3}s", frame.timestamp_seconds());
                            let slot = tokio::select! {
                                biased;
                                _ = token.cancelled() => return Err(ExtractError::Cancelled),
                                slot = self.coordinator.acquire_slot() => slot,
                            };
                            let (done, next_turn) = oneshot::channel();
                            let previous = std::mem::replace(&mut turn, next_turn);
                            self.persisting.push_back(tokio::spawn(persist(
                                frame,
                                slot,
                                previous,
                                done,
                                Arc::clone(&self.job.store),
                                self.job.session.clone(),
                                self.job.config.format,
                                self.job.config.quality,
                            )));
                        }
                        SampleDecision::PastWindow => {
                            log::debug!(
                                "Frame at {:.3}s is past the window; stopping",
                                frame.timestamp_seconds()
                            );
                            decoding = false;
                            self.stages.abort_all();
                        }
                        decision => {
                            log::trace!("Dropping frame at {:.3}s ({decision:?})", frame.timestamp_seconds());
                        }
                    },
                    Some(Err(error)) => return Err(error),
                    None => {
                        log::debug!("Decoder drained");
                        decoding = false;
                    }
                },
            }
        }

        // A failed ingest still closes the sample channel, which lets the
        // decoder drain normally.
        while let Some(joined) = self.stages.join_next().await {
            stage_result(joined)?;
        }
        Ok(())
    }

    fn report(
        &self,
        persisted: Result<ExtractedFrame, ExtractError>,
        tracker: &mut ProgressTracker,
    ) -> Result<(), ExtractError> {
        match persisted {
            Ok(frame) => {
                tracker.frame_kept();
                log::debug!(
                    "Stored frame {} at {:.3}s ({} bytes)",
                    frame.id,
                    frame.timestamp_seconds(),
                    frame.data.len()
                );
                if let Some(preview) = &self.job.preview {
                    preview.on_frame(&frame);
                }
                Ok(())
            }
            Err(error) if !error.is_fatal() => {
                log::warn!("Skipping a kept frame: {error}");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    async fn teardown(&mut self) {
        self.stages.shutdown().await;
        for handle in self.persisting.drain(..) {
            handle.abort();
        }
        if let Some(decoder) = self.decoder.take() {
            decoder.shutdown().await;
        }
        log::debug!("Run {} torn down", self.job.session);
    }
}

async fn ingest(
    mut reader: ChunkedReader,
    mut demuxer: Demuxer,
    coordinator: Coordinator,
    token: CancellationToken,
    track_sender: oneshot::Sender<TrackDescriptor>,
    samples: mpsc::UnboundedSender<Vec<SampleRecord>>,
) -> Result<(), ExtractError> {
    let mut track_sender = Some(track_sender);
    let mut dispatch = |events: Vec<DemuxEvent>| {
        for event in events {
            match event {
                DemuxEvent::Track(track) => {
                    if let Some(sender) = track_sender.take() {
                        let _ = sender.send(track);
                    }
                }
                DemuxEvent::Samples(batch) => {
                    let count = batch.len();
                    coordinator.samples_buffered(count);
                    if samples.send(batch).is_err() {
                        coordinator.samples_discarded(count);
                    }
                }
            }
        }
    };

    let mut reads = 0u64;
    while let Some(offset) = demuxer.next_offset() {
        coordinator.reading_allowed().await;
        if token.is_cancelled() {
            return Ok(());
        }
        let chunk = reader.read_chunk(offset).await?;
        if chunk.is_empty() {
            break;
        }
        reads += 1;
        dispatch(demuxer.push(chunk)?);
    }
    dispatch(demuxer.flush()?);

    log::debug!(
        "Ingest finished after {reads} reads, {} samples",
        demuxer.samples_emitted()
    );
    Ok(())
}

async fn submit(
    mut batches: mpsc::UnboundedReceiver<Vec<SampleRecord>>,
    submitter: SampleSubmitter,
    token: CancellationToken,
) -> Result<(), ExtractError> {
    while let Some(batch) = batches.recv().await {
        for sample in batch {
            if token.is_cancelled() {
                return Ok(());
            }
            if submitter.submit(sample).await.is_err() {
                // The decoder reports its own failure on the frame channel.
                return Ok(());
            }
        }
    }
    let _ = submitter.finish();
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn persist(
    frame: DecodedFrame,
    slot: FrameSlot,
    turn: oneshot::Receiver<()>,
    done: oneshot::Sender<()>,
    store: Arc<dyn FrameStore>,
    session: SessionId,
    format: OutputFormat,
    quality: u8,
) -> Result<ExtractedFrame, ExtractError> {
    let timestamp = frame.timestamp;
    let encoded = tokio::task::spawn_blocking(move || {
        let image = frame.into_image()?;
        encode_frame(&image, format, quality)
    })
    .await
    .map_err(join_error)?;

    // Saves happen in the order frames were kept.
    let _ = turn.await;
    let result = match encoded {
        Ok(data) => {
            let record = ExtractedFrame::new(session, timestamp, data, format);
            let saved = store.save(&record).await;
            saved.map(|()| record)
        }
        Err(error) => Err(error),
    };
    let _ = done.send(());
    drop(slot);
    result
}

async fn next_persisted(
    persisting: &mut VecDeque<Persisting>,
) -> Option<Result<Result<ExtractedFrame, ExtractError>, JoinError>> {
    let handle = persisting.front_mut()?;
    let result = handle.await;
    persisting.pop_front();
    Some(result)
}

fn stage_result(joined: Result<Result<(), ExtractError>, JoinError>) -> Result<(), ExtractError> {
    match joined {
        Ok(result) => result,
        Err(error) if error.is_cancelled() => Ok(()),
        Err(error) => Err(join_error(error)),
    }
}

fn join_error(error: JoinError) -> ExtractError {
    ExtractError::IoError(std::io::Error::from(error))
}
