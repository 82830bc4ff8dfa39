// Block module - block model, merkle roots, rewards, assembly and validation

mod builder;
mod merkle;
mod model;
mod reward;
mod validator;

pub use builder::BlockBuilder;
pub use merkle::merkle_root;
pub use model::{Block, BLOCK_VERSION};
pub use reward::{block_reward, RewardSchedule};
pub use validator::{BlockConfig, BlockError, BlockValidator, TxRejection, ValidationContext};
