//! Build script for returnfeed-bridge
//!
//! Configures NDI SDK paths for linking when the `ndi` feature is enabled.

fn main() {
    println!("cargo:rerun-if-env-changed=NDI_SDK_DIR");

    if std::env::var_os("CARGO_FEATURE_NDI").is_none() {
        return;
    }

    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();

    // Default: "C:\Program Files\NDI\NDI 6 SDK" on Windows, /usr/share/ndi elsewhere
    let ndi_sdk_path = std::env::var("NDI_SDK_DIR").unwrap_or_else(|_| {
        if target_os == "windows" {
            r"C:\Program Files\NDI\NDI 6 SDK".to_string()
        } else {
            "/usr/share/ndi".to_string()
        }
    });

    let lib_path = match target_os.as_str() {
        "windows" => format!(r"{}\Lib\x64", ndi_sdk_path),
        "macos" => format!("{}/lib/macOS", ndi_sdk_path),
        _ => format!("{}/lib/x86_64-linux-gnu", ndi_sdk_path),
    };
    println!("cargo:rustc-link-search=native={}", lib_path);
}
