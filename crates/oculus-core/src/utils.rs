//! 通用工具函数

use crate::error::{OculusError, Result};
use chrono::NaiveDate;
use rand::RngCore;

/// 访问码长度（4个随机字节的十六进制表示）
pub const ACCESS_CODE_LEN: usize = 8;

/// 生成患者访问码：8位小写十六进制字符
pub fn generate_access_code() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// 验证访问码格式
pub fn is_valid_access_code(code: &str) -> bool {
    code.len() == ACCESS_CODE_LEN
        && code.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// 解析 `YYYY-MM-DD` 格式的日期
pub fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| OculusError::Validation(format!("日期格式错误，应为YYYY-MM-DD: {}", value)))
}

/// 去除首尾空白，空字符串视为未填写
pub fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// 必填文本字段
pub fn require_text(field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(OculusError::Validation(format!("{} 不能为空", field)));
    }
    Ok(trimmed.to_string())
}
