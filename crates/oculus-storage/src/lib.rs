//! # Oculus存储模块
//!
//! 负责上传文件（检查结果扫描件、诊断报告）的对象存储，支持本地目录、S3兼容存储和内存存储。

pub mod storage;

pub use storage::{S3Settings, StorageManager};
