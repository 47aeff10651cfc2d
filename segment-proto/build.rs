// Build script for segment-proto
// Compiles Protocol Buffer definitions for gRPC

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/controller.proto"], &["proto"])?;

    tonic_prost_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&["proto/containerd_events.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/controller.proto");
    println!("cargo:rerun-if-changed=proto/containerd_events.proto");

    Ok(())
}
