//! Built-in transforms.
//!
//! Every transform is a plain value holding its own options; the pipeline
//! decides where it runs and whether its results are cached.

mod css;
mod optimize;
mod sass;
mod sprite;
mod text;

pub use css::{Autoprefix, MergeMediaQueries, Minify, StripComments, targets};
pub use optimize::OptimizeImage;
pub use sass::{GlobImports, Sass};
pub use sprite::{Sprite, Symbolize};
pub use text::{Concat, LineEndings, Rename};
