//! Telegram患者通知渠道
//!
//! 接收端通过 `getUpdates` 长轮询处理患者命令：`/start <访问码>` 或直接发送访问码完成绑定，
//! `/status` 查询当前状态，`/stop` 取消订阅。状态变化进入有界队列，
//! 由单个发送任务推送，两次发送之间保持最小间隔。

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use oculus_core::models::{CaseStatus, PatientCase};
use oculus_core::utils::is_valid_access_code;
use oculus_core::OculusError;
use oculus_database::Store;
use oculus_workflow::{PatientNotifier, WorkflowEngine};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 轮询失败后的等待时间
const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<IncomingMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

/// Bot API客户端
#[derive(Debug, Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    base_url: String,
}

impl TelegramClient {
    pub fn new(api_base: &str, token: &str, poll_timeout_secs: u64) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(poll_timeout_secs + 10))
            .build()
            .context("无法创建Telegram HTTP客户端")?;
        Ok(Self {
            http,
            base_url: format!("{}/bot{}", api_base.trim_end_matches('/'), token),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: serde_json::Value) -> anyhow::Result<T> {
        let url = format!("{}/{}", self.base_url, method);
        let response: ApiResponse<T> = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Telegram {} 请求失败", method))?
            .json()
            .await
            .with_context(|| format!("Telegram {} 响应无法解析", method))?;
        if !response.ok {
            return Err(anyhow!(
                "Telegram {} 返回错误: {}",
                method,
                response.description.unwrap_or_default()
            ));
        }
        response
            .result
            .ok_or_else(|| anyhow!("Telegram {} 响应缺少result", method))
    }

    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> anyhow::Result<Vec<Update>> {
        self.call(
            "getUpdates",
            serde_json::json!({
                "offset": offset,
                "timeout": timeout_secs,
                "allowed_updates": ["message"],
            }),
        )
        .await
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        let _: serde_json::Value = self
            .call("sendMessage", serde_json::json!({ "chat_id": chat_id, "text": text }))
            .await?;
        Ok(())
    }
}

/// 患者发送的命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Start(Option<String>),
    Code(String),
    Status,
    Stop,
    Help,
}

pub fn parse_command(text: &str) -> BotCommand {
    let text = text.trim();
    if text.starts_with('/') {
        let mut parts = text.split_whitespace();
        let command = parts
            .next()
            .and_then(|c| c.split('@').next())
            .unwrap_or_default()
            .to_ascii_lowercase();
        return match command.as_str() {
            "/start" => BotCommand::Start(parts.next().map(str::to_string)),
            "/status" => BotCommand::Status,
            "/stop" => BotCommand::Stop,
            _ => BotCommand::Help,
        };
    }
    let code = text.to_ascii_lowercase();
    if is_valid_access_code(&code) {
        BotCommand::Code(code)
    } else {
        BotCommand::Help
    }
}

pub fn status_label(status: CaseStatus) -> &'static str {
    match status {
        CaseStatus::Draft => "черновик",
        CaseStatus::New => "новая заявка",
        CaseStatus::Preparation => "подготовка к операции",
        CaseStatus::ReviewNeeded => "на проверке у хирурга",
        CaseStatus::NeedsCorrection => "требуются исправления",
        CaseStatus::Approved => "одобрено хирургом",
        CaseStatus::SurgeryScheduled => "операция назначена",
        CaseStatus::Completed => "операция проведена",
        CaseStatus::Rejected => "отказано",
        CaseStatus::Cancelled => "отменено",
    }
}

pub fn status_text(case: &PatientCase) -> String {
    let mut text = format!(
        "{} {}: {}",
        case.last_name,
        case.first_name,
        status_label(case.status)
    );
    if let Some(date) = case.surgery_date {
        text.push_str(&format!("\nДата операции: {}", date.format("%d.%m.%Y")));
    }
    text
}

const HELP_TEXT: &str = "Отправьте код доступа из направления (8 символов), \
чтобы получать уведомления о статусе подготовки.\n/status — текущий статус\n/stop — отписаться";

/// 生成对一条消息的回复
pub async fn reply_to(engine: &WorkflowEngine, chat_id: i64, text: &str) -> String {
    match parse_command(text) {
        BotCommand::Start(Some(code)) | BotCommand::Code(code) => bind(engine, chat_id, &code).await,
        BotCommand::Start(None) | BotCommand::Help => HELP_TEXT.to_string(),
        BotCommand::Status => current_status(engine, chat_id).await,
        BotCommand::Stop => match engine.store().deactivate_telegram_binding(chat_id).await {
            Ok(true) => "Уведомления отключены.".to_string(),
            Ok(false) => "Подписка не найдена.".to_string(),
            Err(e) => unavailable(e),
        },
    }
}

fn unavailable(e: OculusError) -> String {
    warn!("Telegram command failed: {}", e);
    "Сервис временно недоступен, попробуйте позже.".to_string()
}

async fn bind(engine: &WorkflowEngine, chat_id: i64, code: &str) -> String {
    let case = match engine.resolve_access_code(code).await {
        Ok(case) => case,
        Err(OculusError::NotFound(_)) => return "Код доступа не найден.".to_string(),
        Err(e) => return unavailable(e),
    };
    match engine
        .store()
        .upsert_telegram_binding(chat_id, case.id, &case.access_code)
        .await
    {
        Ok(_) => {
            info!("Chat {} bound to case {}", chat_id, case.id);
            format!("Вы подписаны на уведомления.\n{}", status_text(&case))
        }
        Err(e) => unavailable(e),
    }
}

async fn current_status(engine: &WorkflowEngine, chat_id: i64) -> String {
    let binding = match engine.store().get_telegram_binding(chat_id).await {
        Ok(Some(binding)) if binding.is_active => binding,
        Ok(_) => return "Сначала отправьте код доступа.".to_string(),
        Err(e) => return unavailable(e),
    };
    match engine.store().get_case(binding.case_id).await {
        Ok(Some(case)) => status_text(&case),
        Ok(None) => "Заявка не найдена.".to_string(),
        Err(e) => unavailable(e),
    }
}

/// 长轮询接收端
pub struct TelegramBot {
    client: TelegramClient,
    engine: WorkflowEngine,
    poll_timeout_secs: u64,
}

impl TelegramBot {
    pub fn new(client: TelegramClient, engine: WorkflowEngine, poll_timeout_secs: u64) -> Self {
        Self {
            client,
            engine,
            poll_timeout_secs,
        }
    }

    /// 运行直到取消
    pub async fn run(self, cancel: CancellationToken) {
        info!("Telegram bot polling started");
        let mut offset = 0;
        loop {
            let updates = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.client.get_updates(offset, self.poll_timeout_secs) => result,
            };
            match updates {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        let Some(message) = update.message else { continue };
                        let Some(text) = message.text else { continue };
                        let reply = reply_to(&self.engine, message.chat.id, &text).await;
                        if let Err(e) = self.client.send_message(message.chat.id, &reply).await {
                            warn!("Failed to reply to chat {}: {:#}", message.chat.id, e);
                        }
                    }
                }
                Err(e) => {
                    warn!("Telegram polling failed: {:#}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
            }
        }
        info!("Telegram bot polling stopped");
    }
}

/// 全局发送节流：两次发送之间至少间隔 `interval`
#[derive(Debug)]
pub struct SendLimiter {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl SendLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            tokio::time::sleep_until(previous + self.interval).await;
        }
        *last = Some(Instant::now());
    }
}

/// 状态变化推送的入队端
///
/// 请求路径上只做非阻塞入队，队列满时丢弃；单个 [`TelegramSender`] 任务按最小间隔发送。
#[derive(Clone, Debug)]
pub struct TelegramNotifier {
    sender: mpsc::Sender<PatientCase>,
}

/// 推送发送任务
pub struct TelegramSender {
    receiver: mpsc::Receiver<PatientCase>,
    client: Arc<TelegramClient>,
    store: Arc<dyn Store>,
    limiter: SendLimiter,
}

/// 创建推送队列
pub fn telegram_notifier(
    client: Arc<TelegramClient>,
    store: Arc<dyn Store>,
    min_interval: Duration,
    capacity: usize,
) -> (TelegramNotifier, TelegramSender) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (
        TelegramNotifier { sender },
        TelegramSender {
            receiver,
            client,
            store,
            limiter: SendLimiter::new(min_interval),
        },
    )
}

#[async_trait]
impl PatientNotifier for TelegramNotifier {
    async fn case_status_changed(&self, case: &PatientCase) {
        match self.sender.try_send(case.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(case)) => {
                warn!("Telegram queue full, dropping status push of case {}", case.id)
            }
            Err(TrySendError::Closed(case)) => {
                warn!("Telegram sender stopped, dropping status push of case {}", case.id)
            }
        }
    }
}

impl TelegramSender {
    /// 运行直到取消或所有入队端释放
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Telegram sender started");
        loop {
            let case = tokio::select! {
                _ = cancel.cancelled() => break,
                case = self.receiver.recv() => match case {
                    Some(case) => case,
                    None => break,
                },
            };
            self.push(&case).await;
        }
        info!("Telegram sender stopped");
    }

    async fn push(&self, case: &PatientCase) {
        let bindings = match self.store.active_bindings_for_case(case.id).await {
            Ok(bindings) => bindings,
            Err(e) => {
                warn!("Failed to load Telegram bindings of case {}: {}", case.id, e);
                return;
            }
        };
        let text = format!("Статус заявки обновлён.\n{}", status_text(case));
        for binding in bindings {
            self.limiter.wait().await;
            match self.client.send_message(binding.chat_id, &text).await {
                Ok(()) => debug!("Status of case {} pushed to chat {}", case.id, binding.chat_id),
                Err(e) => warn!("Failed to push status to chat {}: {:#}", binding.chat_id, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oculus_admin::Metrics;
    use oculus_core::models::{Eye, OperationType, UserRole};
    use oculus_database::MemoryStore;
    use oculus_storage::StorageManager;
    use oculus_workflow::{Caller, NewCaseRequest};

    fn engine() -> WorkflowEngine {
        WorkflowEngine::new(
            Arc::new(MemoryStore::new()),
            StorageManager::in_memory(),
            Metrics::new().unwrap(),
        )
    }

    async fn new_case(engine: &WorkflowEngine) -> PatientCase {
        let request = NewCaseRequest {
            first_name: "Туяра".into(),
            last_name: "Алексеева".into(),
            middle_name: None,
            birth_date: None,
            phone: None,
            email: None,
            address: None,
            snils: None,
            oms_policy: None,
            diagnosis: None,
            operation_type: OperationType::Phaco,
            eye: Eye::Os,
            district_id: None,
            doctor_id: None,
            notes: None,
        };
        engine
            .create_case(&Caller::staff(10, UserRole::DistrictDoctor), request)
            .await
            .unwrap()
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("/start 0A1B2C3D"), BotCommand::Start(Some("0A1B2C3D".into())));
        assert_eq!(parse_command("/start"), BotCommand::Start(None));
        assert_eq!(parse_command("/status@oculus_bot"), BotCommand::Status);
        assert_eq!(parse_command(" /STOP "), BotCommand::Stop);
        assert_eq!(parse_command("0A1B2C3D"), BotCommand::Code("0a1b2c3d".into()));
        assert_eq!(parse_command("привет"), BotCommand::Help);
    }

    #[tokio::test]
    async fn test_bind_status_and_stop() {
        let engine = engine();
        let case = new_case(&engine).await;

        let reply = reply_to(&engine, 77, "/status").await;
        assert!(reply.contains("код доступа"));

        let reply = reply_to(&engine, 77, &format!("/start {}", case.access_code)).await;
        assert!(reply.contains("подготовка к операции"));
        assert_eq!(engine.store().active_bindings_for_case(case.id).await.unwrap().len(), 1);

        let reply = reply_to(&engine, 77, "/status").await;
        assert!(reply.starts_with("Алексеева Туяра"));

        assert_eq!(reply_to(&engine, 77, "/stop").await, "Уведомления отключены.");
        assert!(engine.store().active_bindings_for_case(case.id).await.unwrap().is_empty());
        assert_eq!(reply_to(&engine, 77, "/stop").await, "Подписка не найдена.");
    }

    #[tokio::test]
    async fn test_unknown_code() {
        let engine = engine();
        assert_eq!(reply_to(&engine, 1, "ffffffff").await, "Код доступа не найден.");
        assert_eq!(reply_to(&engine, 1, "hello").await, HELP_TEXT);
    }

    #[tokio::test]
    async fn test_notifier_queue_is_bounded() {
        let engine = engine();
        let case = new_case(&engine).await;
        let client = Arc::new(TelegramClient::new("http://127.0.0.1:9", "token", 1).unwrap());
        let (notifier, mut sender) =
            telegram_notifier(client, engine.store().clone(), Duration::from_millis(1), 2);

        for _ in 0..5 {
            notifier.case_status_changed(&case).await;
        }
        let mut queued = 0;
        while sender.receiver.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 2);

        // 没有绑定的病例不会发起请求；取消后任务退出
        notifier.case_status_changed(&case).await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(sender.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_limiter_spaces_sends() {
        let limiter = SendLimiter::new(Duration::from_millis(20));
        let started = Instant::now();
        for _ in 0..3 {
            limiter.wait().await;
        }
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
