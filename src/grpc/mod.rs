pub mod codec;
pub mod proxy;
pub mod server;

pub use proxy::GrpcProxy;
pub use server::run_grpc_server;
