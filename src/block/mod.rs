//! Raw block storage, the shared block ring, and block assembly.

pub mod assembler;
pub mod ring;
pub mod view;

pub use assembler::BlockAssembler;
pub use ring::{BlockRing, RawBlock};
pub use view::BlockView;
