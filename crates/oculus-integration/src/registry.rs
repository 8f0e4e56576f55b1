//! 外部医疗登记系统连接器
//!
//! 真实的登记系统协议不在范围内；桩实现根据登记系统名称和病例id
//! 生成确定性的外部标识符。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oculus_admin::RegistriesConfig;
use oculus_core::models::PatientCase;
use oculus_core::{OculusError, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// 登记系统描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryInfo {
    pub name: String,
    pub description: String,
}

/// 提交结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrySubmission {
    pub registry: String,
    pub case_id: i64,
    pub external_id: String,
    pub submitted_at: DateTime<Utc>,
}

/// 登记系统连接器接口
#[async_trait]
pub trait RegistryConnector: Send + Sync {
    fn info(&self) -> RegistryInfo;

    /// 提交病例，返回登记系统中的标识符
    async fn submit_case(&self, case: &PatientCase) -> Result<RegistrySubmission>;
}

/// 确定性桩连接器
#[derive(Debug, Clone)]
pub struct StubRegistry {
    name: String,
    description: String,
}

impl StubRegistry {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }

    /// `SHA-256(name:case_id)` 的前16个十六进制字符，加大写登记系统前缀
    pub fn external_id(name: &str, case_id: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(case_id.to_string().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        format!("{}-{}", name.to_ascii_uppercase(), &digest[..16])
    }
}

#[async_trait]
impl RegistryConnector for StubRegistry {
    fn info(&self) -> RegistryInfo {
        RegistryInfo {
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }

    async fn submit_case(&self, case: &PatientCase) -> Result<RegistrySubmission> {
        let external_id = Self::external_id(&self.name, case.id);
        info!("Case {} submitted to registry {} as {}", case.id, self.name, external_id);
        Ok(RegistrySubmission {
            registry: self.name.clone(),
            case_id: case.id,
            external_id,
            submitted_at: Utc::now(),
        })
    }
}

fn known_registry(name: &str) -> Option<StubRegistry> {
    match name {
        "emias" => Some(StubRegistry::new(
            "emias",
            "Единая медицинская информационно-аналитическая система",
        )),
        "riams" => Some(StubRegistry::new(
            "riams",
            "Региональная информационно-аналитическая медицинская система",
        )),
        _ => None,
    }
}

/// 已启用的登记系统集合
#[derive(Clone, Default)]
pub struct RegistryHub {
    connectors: BTreeMap<String, Arc<dyn RegistryConnector>>,
}

impl std::fmt::Debug for RegistryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryHub")
            .field("registries", &self.connectors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RegistryHub {
    /// 按配置启用登记系统，未知名称视为配置错误
    pub fn from_config(config: &RegistriesConfig) -> Result<Self> {
        let mut hub = Self::default();
        for name in &config.enabled {
            let name = name.trim().to_ascii_lowercase();
            let connector = known_registry(&name)
                .ok_or_else(|| OculusError::Config(format!("未知的登记系统: {}", name)))?;
            hub.register(Arc::new(connector));
        }
        Ok(hub)
    }

    pub fn register(&mut self, connector: Arc<dyn RegistryConnector>) {
        self.connectors.insert(connector.info().name, connector);
    }

    pub fn list(&self) -> Vec<RegistryInfo> {
        self.connectors.values().map(|c| c.info()).collect()
    }

    pub async fn submit(&self, registry: &str, case: &PatientCase) -> Result<RegistrySubmission> {
        let connector = self
            .connectors
            .get(registry)
            .ok_or_else(|| OculusError::NotFound(format!("登记系统未启用: {}", registry)))?;
        connector.submit_case(case).await
    }
}
