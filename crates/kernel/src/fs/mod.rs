// File systems.

pub mod ktfs;

pub use ktfs::KtFs;
