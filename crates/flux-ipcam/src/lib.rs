pub mod auth;
pub mod brand;
pub mod engine;
pub mod error;
pub mod model;
pub mod server;
pub mod supervisor;
pub mod tracker;
pub mod transport;
pub mod xml;

pub use brand::{create_adapter, AdapterContext, AdapterOutput, BrandAdapter};
pub use engine::CameraEngine;
pub use error::{CameraError, ErrorCategory, Result};
pub use model::{
    AlarmEvent, AlarmKind, Brand, CameraCommand, ConnectionState, Device, DeviceEvent, PtzVector,
};
pub use server::{create_router, MediaServer, MediaState};
pub use supervisor::{DeviceHandle, MediaSources, Supervisor, SupervisorDeps};
pub use tracker::RequestTracker;
pub use transport::{
    http_transport_factory, CameraTransport, HttpTransport, Method, TransportFactory, VendorReply,
    VendorRequest,
};
