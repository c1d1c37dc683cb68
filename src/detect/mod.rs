mod backend;
mod backends;
mod registry;
mod result;

pub use backend::{BlobParams, ComputeTarget, DetectorBackend, ModelSpec};
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use registry::{BackendFactory, BackendRegistry};
pub use result::{raw_detections, OutputTensor, RawDetection, CLASS_SCORE_OFFSET};
