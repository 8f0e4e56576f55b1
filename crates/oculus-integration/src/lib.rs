//! # Oculus集成模块
//!
//! 提供与外部系统的集成功能，包括：
//! - Telegram患者通知渠道：命令接收与状态推送
//! - 外部医疗登记系统连接器（确定性桩实现）

pub mod registry;
pub mod telegram;

pub use registry::{RegistryConnector, RegistryHub, RegistryInfo, RegistrySubmission, StubRegistry};
pub use telegram::{telegram_notifier, TelegramBot, TelegramClient, TelegramNotifier, TelegramSender};
