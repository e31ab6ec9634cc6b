//! A single-file keyed blob store: arbitrary string names map to opaque
//! byte payloads kept contiguously in one data file. Mounting rebuilds
//! the in-memory index and the free-space list from the node headers
//! embedded in the data file, reclaiming anything a crash left behind.

mod common;
pub mod db;
pub mod errors;
mod freelist;
mod node;
mod recovery;
#[cfg(test)]
mod testing;

pub use db::{BlockFs, Options, Stats};
pub use errors::{BlockFsError, Result};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_works() {
        println!("{}", errors::BlockFsError::ReadOnly);

        let fs = testing::TestFs::new().unwrap();
        assert!(fs.data_owner());
    }
}
