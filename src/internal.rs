#[macro_use]
pub mod optim;

mod commit;

pub mod conflict;
pub mod orec;
pub mod parking;
pub mod storage;
pub mod tranlocal;
