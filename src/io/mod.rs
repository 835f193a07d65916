pub mod mesh;
pub mod sequence;

pub use mesh::{load_models, load_obj_mesh};
pub use sequence::{RecordedSequence, ReplayStep};
