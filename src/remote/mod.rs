pub mod agent;
pub mod server;

/// Generated gRPC bindings for the agent wire schema.
pub mod api {
    tonic::include_proto!("api");
}
