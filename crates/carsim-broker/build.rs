//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "build"
//! ems_description: "Generates the data broker Collector client and server stubs."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
fn main() {
    let protoc = protoc_bin_vendored::protoc_bin_path().expect("failed to locate protoc");
    std::env::set_var("PROTOC", protoc);

    println!("cargo:rerun-if-changed=proto/databroker.proto");
    println!("cargo:rerun-if-changed=proto");

    // the server half backs the in-process broker used by the tests
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/databroker.proto"], &["proto"])
        .expect("failed to compile data broker definitions");
}
