//! Prompt data: datasets of token ids and a resumable batch loader.

mod dataset;
mod loader;

pub use dataset::PromptDataset;
pub use loader::{DataLoaderState, PromptDataLoader};
