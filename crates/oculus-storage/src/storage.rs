//! 文件存储管理

use bytes::Bytes;
use object_store::{
    aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory, path::Path, ObjectStore,
};
use oculus_core::{OculusError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// S3兼容存储参数
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3Settings {
    pub endpoint: Option<String>,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub allow_http: bool,
}

/// 存储管理器
#[derive(Clone)]
pub struct StorageManager {
    store: Arc<dyn ObjectStore>,
    backend: &'static str,
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager")
            .field("backend", &self.backend)
            .finish()
    }
}

impl StorageManager {
    /// 本地目录存储
    pub fn local(base_path: &str) -> Result<Self> {
        std::fs::create_dir_all(base_path)?;
        let store = LocalFileSystem::new_with_prefix(base_path).map_err(storage_error)?;
        info!("Using local media storage at {}", base_path);
        Ok(Self {
            store: Arc::new(store),
            backend: "local",
        })
    }

    /// S3兼容对象存储
    pub fn s3(settings: &S3Settings) -> Result<Self> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&settings.bucket)
            .with_access_key_id(&settings.access_key)
            .with_secret_access_key(&settings.secret_key)
            .with_region(&settings.region)
            .with_allow_http(settings.allow_http);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        let store = builder.build().map_err(storage_error)?;
        info!("Using S3 media storage, bucket {}", settings.bucket);
        Ok(Self {
            store: Arc::new(store),
            backend: "s3",
        })
    }

    /// 内存存储（测试与演示）
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemory::new()),
            backend: "memory",
        }
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// 为病例文件生成存储键：`cases/<case_id>/<uuid>-<file_name>`
    pub fn media_key(case_id: i64, file_name: &str) -> String {
        format!(
            "cases/{}/{}-{}",
            case_id,
            uuid::Uuid::new_v4().simple(),
            sanitize_file_name(file_name)
        )
    }

    /// 存储文件
    pub async fn store_file(&self, key: &str, data: Bytes) -> Result<()> {
        let size = data.len();
        self.store
            .put(&Path::from(key), data)
            .await
            .map_err(storage_error)?;
        debug!("Stored {} bytes at {}", size, key);
        Ok(())
    }

    /// 获取文件
    pub async fn get_file(&self, key: &str) -> Result<Bytes> {
        let result = self.store.get(&Path::from(key)).await.map_err(storage_error)?;
        result.bytes().await.map_err(storage_error)
    }

    /// 删除文件，文件不存在时视为成功
    pub async fn delete_file(&self, key: &str) -> Result<()> {
        match self.store.delete(&Path::from(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(storage_error(e)),
        }
    }
}

fn storage_error(e: object_store::Error) -> OculusError {
    match e {
        object_store::Error::NotFound { path, .. } => {
            OculusError::NotFound(format!("文件不存在: {}", path))
        }
        other => OculusError::Storage(other.to_string()),
    }
}

/// 只保留安全字符，避免路径穿越
fn sanitize_file_name(file_name: &str) -> String {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}
