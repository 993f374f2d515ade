//! Build script for machined-cri
//!
//! Compiles the CRI runtime.v1 proto definitions.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        // Clients are used by the integration tests and crictl-style tooling.
        .build_client(true)
        .compile(&["proto/runtime.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/runtime.proto");

    Ok(())
}
