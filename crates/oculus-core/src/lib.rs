//! # Oculus Core
//!
//! 术前准备系统的核心模块，提供领域数据结构、错误定义、查询参数和通用工具。

pub mod error;
pub mod models;
pub mod query;
pub mod utils;

pub use error::{ErrorKind, OculusError, Result};
pub use models::*;
pub use query::*;
