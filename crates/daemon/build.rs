use tonic_build::manual::{Builder, Method, Service};

// NodeService is declared in Rust (messages live in src/grpc.rs) so the build
// does not depend on a protoc binary being installed.
fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let methods = [
        ("login", "Login"),
        ("read_node", "ReadNode"),
        ("create_node", "CreateNode"),
        ("update_node", "UpdateNode"),
        ("delete_node", "DeleteNode"),
        ("get_peers", "GetPeers"),
        ("get_ext_peers", "GetExtPeers"),
    ];

    let mut service = Service::builder()
        .name("NodeService")
        .package("wgmesh.v1");

    for (name, route) in methods {
        service = service.method(
            Method::builder()
                .name(name)
                .route_name(route)
                .input_type("crate::grpc::proto::Object")
                .output_type("crate::grpc::proto::Object")
                .codec_path("tonic::codec::ProstCodec")
                .build(),
        );
    }

    Builder::new().compile(&[service.build()]);
}
