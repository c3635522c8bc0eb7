#![doc = include_str!("../README.md")]
#![doc(test(attr(deny(warnings))))]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod metrics;
pub mod model;
pub mod sparql;
pub mod storage;
pub mod store;
