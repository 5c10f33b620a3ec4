//! # asr-dataset
//!
//! Список данных → батчи → дополненные тензоры.

pub mod collate;
pub mod data_list;
pub mod dataset;

pub use collate::{CollateFunc, DataLoader};
pub use data_list::{DataList, DataListEntry};
pub use dataset::AudioDataset;
