//! A content-addressed filesystem store that maps opaque fixed-width content
//! hashes to directory subtrees, with cross-thread and cross-process
//! coordination of who gets to build each one.
//!
//! See [`ContentStore`] for the entry point.

mod encoding;
mod error;
mod hash;
mod lock;
mod prelude;
mod seal;
mod store;
mod util;
mod watch;

pub use error::{Result, StoreError};
pub use hash::{ContentHash, InvalidEncoding};
pub use store::{
    Construct, ConstructOrWait, ContentStore, DirHasher, Item, Listing, LookupOrWait, State,
    StateTag,
};
pub use watch::{Resolution, Subscription};
