mod assets;
mod douyu;
mod gist;
mod index;
mod raw;

pub use assets::*;
pub use douyu::*;
pub use gist::*;
pub use index::*;
pub use raw::*;

#[derive(serde::Serialize)]
pub struct ErrorResponse {
    pub message: &'static str,
}
