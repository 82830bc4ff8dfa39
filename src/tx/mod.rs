// Transaction module - value transfers, staking operations and protocol mints

mod amount;
mod builder;
mod codec;
mod model;
mod validator;

pub use amount::*;
pub use builder::*;
pub use codec::*;
pub use model::*;
pub use validator::*;
