//! Points Windows builds at a vcpkg FFmpeg install when `FFMPEG_DIR` is
//! unset. Other targets rely on pkg-config through `ffmpeg-sys-next`.

use std::{env, path::Path};

fn main() {
    for variable in ["FFMPEG_DIR", "VCPKG_ROOT", "VCPKGRS_TRIPLET"] {
        println!("cargo:rerun-if-env-changed={variable}");
    }

    if env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("windows")
        || env::var_os("FFMPEG_DIR").is_some()
    {
        return;
    }

    let Some(vcpkg_root) = env::var_os("VCPKG_ROOT") else {
        println!("cargo:warning=stillcut: set FFMPEG_DIR to an FFmpeg install with development libraries");
        return;
    };
    let triplet = env::var("VCPKGRS_TRIPLET").unwrap_or_else(|_| "x64-windows".to_string());
    let install = Path::new(&vcpkg_root).join("installed").join(&triplet);

    if install.join("include").join("libavcodec").is_dir() {
        println!(
            "cargo:warning=stillcut: found FFmpeg under {}; set FFMPEG_DIR to it if linking fails",
            install.display()
        );
    } else {
        println!(
            "cargo:warning=stillcut: no FFmpeg for triplet {triplet} under {}",
            install.display()
        );
    }
}
