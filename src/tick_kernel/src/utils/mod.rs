//! Utility
mod init;
pub(crate) mod delta_list;
pub(crate) mod intrusive_list;

pub use self::init::Init;
