//! 病例文件
//!
//! 文件内容写入对象存储，元数据写入数据库；元数据写入失败时回滚已存储的对象。

use crate::engine::WorkflowEngine;
use crate::rbac::Caller;
use bytes::Bytes;
use oculus_core::models::Media;
use oculus_core::utils::require_text;
use oculus_core::{OculusError, Result};
use oculus_database::NewMedia;
use oculus_storage::StorageManager;
use tracing::{info, warn};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// 上传请求
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl WorkflowEngine {
    pub async fn upload_media(&self, caller: &Caller, case_id: i64, upload: MediaUpload) -> Result<Media> {
        let case = self.load_case(case_id).await?;
        caller.ensure_can_mutate(&case)?;
        let file_name = require_text("file_name", &upload.file_name)?;
        if upload.data.is_empty() {
            return Err(OculusError::Validation("文件内容为空".to_string()));
        }

        let key = StorageManager::media_key(case_id, &file_name);
        let size = upload.data.len() as i64;
        self.storage().store_file(&key, upload.data).await?;

        let record = NewMedia {
            case_id,
            file_name,
            content_type: upload
                .content_type
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            size_bytes: size,
            storage_key: key.clone(),
            uploaded_by: caller.actor_id(),
        };
        match self.store().insert_media(record).await {
            Ok(media) => {
                info!("Media {} ({} bytes) uploaded for case {}", media.id, size, case_id);
                Ok(media)
            }
            Err(e) => {
                if let Err(cleanup) = self.storage().delete_file(&key).await {
                    warn!("Failed to remove orphaned object {}: {}", key, cleanup);
                }
                Err(e)
            }
        }
    }

    /// 下载文件，病例已删除的文件不可访问
    pub async fn download_media(&self, caller: &Caller, id: i64) -> Result<(Media, Bytes)> {
        let media = self
            .store()
            .get_media(id)
            .await?
            .ok_or_else(|| OculusError::NotFound(format!("文件不存在: {}", id)))?;
        let case = self
            .store()
            .get_case(media.case_id)
            .await?
            .ok_or_else(|| OculusError::NotFound(format!("文件不存在: {}", id)))?;
        caller.ensure_can_view(&case)?;
        let data = self.storage().get_file(&media.storage_key).await?;
        Ok((media, data))
    }

    pub async fn list_media(&self, caller: &Caller, case_id: i64) -> Result<Vec<Media>> {
        let case = self.load_case(case_id).await?;
        caller.ensure_can_view(&case)?;
        self.store().list_media(case_id).await
    }
}
