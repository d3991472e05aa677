pub mod camera;
pub mod detect;
pub mod embed;
pub mod model;
pub mod pipeline;

pub use camera::Camera;
pub use detect::Detection;
pub use embed::Embedding;
pub use model::ModelPaths;
pub use pipeline::Pipeline;
