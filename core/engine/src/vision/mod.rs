pub mod preprocess;
pub mod projector;

pub use preprocess::{image_to_tensor, preprocess_image, DEFAULT_IMAGE_SIZE};
pub use projector::{gelu, ProjectorFiles, VisionProjector};
