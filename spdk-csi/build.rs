fn main() -> Result<(), Box<dyn std::error::Error>> {
    // CSI v1 services exposed by the driver
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_protos(&["../proto/csi.proto"], &["../proto"])?;

    // Accelerator APIs. Servers are generated too so tests can run
    // in-process fakes of the SMA and OPI endpoints.
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &["../proto/sma.proto", "../proto/opi_storage.proto"],
            &["../proto"],
        )?;

    Ok(())
}
