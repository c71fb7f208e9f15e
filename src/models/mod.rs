pub mod bet;
pub mod market;
pub mod wallet;

pub use bet::*;
pub use market::*;
pub use wallet::*;
