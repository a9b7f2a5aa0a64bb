mod request;
pub mod wire;

pub use request::{ProxyRequest, ProxyResponse};
pub use wire::{BodyLocation, LargePayloadReference, WorkerRequest, WorkerResponse};
