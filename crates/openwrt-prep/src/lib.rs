pub mod arch;
pub mod archive;
pub mod coordinator;
pub mod error;
pub mod flavor;
pub mod net;
pub mod patch;
pub mod rewrite;
pub mod run;
pub mod settings;
pub mod source;
pub mod toolchain;
pub mod util;
pub mod workspace;

pub use error::{Error, Result};
