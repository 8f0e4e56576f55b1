//! 周期任务
//!
//! 单个协作式定时器按本地时间每天运行三个任务：
//! 清单项过期、孤儿文件清理和手术提醒。同一tick内的任务顺序执行；
//! 错过的时间窗口直接跳过，不补跑。任务失败只记录日志和指标。

use crate::engine::WorkflowEngine;
use crate::notifications::{patient_name, CaseMessage};
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDate, NaiveTime, Utc};
use oculus_admin::SweeperConfig;
use oculus_core::models::{ChecklistItem, NotificationType};
use oculus_core::Result;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 手术提醒提前天数
pub const REMINDER_OFFSETS: [i64; 2] = [3, 1];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SweepJob {
    ExpireItems,
    CleanupOrphans,
    SurgeryReminders,
}

impl SweepJob {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ExpireItems => "expire_items",
            Self::CleanupOrphans => "cleanup_orphans",
            Self::SurgeryReminders => "surgery_reminders",
        }
    }
}

/// 周期任务执行器
#[derive(Debug)]
pub struct Sweeper {
    engine: WorkflowEngine,
    tick: Duration,
    offset: FixedOffset,
    schedule: Vec<(SweepJob, NaiveTime)>,
    last_run: HashMap<SweepJob, NaiveDate>,
}

impl Sweeper {
    pub fn new(engine: WorkflowEngine, config: &SweeperConfig) -> Result<Self> {
        let mut schedule = vec![
            (SweepJob::ExpireItems, config.expire_items_time()?),
            (SweepJob::CleanupOrphans, config.cleanup_orphans_time()?),
            (SweepJob::SurgeryReminders, config.surgery_reminders_time()?),
        ];
        schedule.sort_by_key(|(_, at)| *at);
        Ok(Self {
            engine,
            tick: config.tick().max(Duration::from_secs(1)),
            offset: config.offset()?,
            schedule,
            last_run: HashMap::new(),
        })
    }

    fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset).date_naive()
    }

    /// 当前时刻落在 `[at, at + tick)` 窗口内且当天尚未运行的任务
    pub fn due_jobs(&self, now: DateTime<Utc>) -> Vec<SweepJob> {
        let local = now.with_timezone(&self.offset).naive_local();
        let today = local.date();
        let window = ChronoDuration::from_std(self.tick).unwrap_or(ChronoDuration::seconds(60));
        self.schedule
            .iter()
            .filter(|(job, at)| {
                let start = today.and_time(*at);
                local >= start && local < start + window && self.last_run.get(job) != Some(&today)
            })
            .map(|(job, _)| *job)
            .collect()
    }

    /// 执行一个tick，返回本次运行的任务及是否成功
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Vec<(SweepJob, bool)> {
        let today = self.local_date(now);
        let mut outcomes = Vec::new();
        for job in self.due_jobs(now) {
            self.last_run.insert(job, today);
            let ok = match self.run_job(job, now).await {
                Ok(affected) => {
                    info!("Sweeper job {} finished, {} affected", job.name(), affected);
                    true
                }
                Err(e) => {
                    error!("Sweeper job {} failed: {}", job.name(), e);
                    false
                }
            };
            self.engine.metrics().record_job(job.name(), ok);
            outcomes.push((job, ok));
        }
        outcomes
    }

    pub async fn run_job(&self, job: SweepJob, now: DateTime<Utc>) -> Result<usize> {
        match job {
            SweepJob::ExpireItems => self.expire_items(now).await,
            SweepJob::CleanupOrphans => self.cleanup_orphans().await,
            SweepJob::SurgeryReminders => self.surgery_reminders(self.local_date(now)).await,
        }
    }

    /// 标记过期清单项并通知主治医生；病例状态不回退
    pub async fn expire_items(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self.engine.store().expire_items(now).await?;
        let mut by_case: BTreeMap<i64, Vec<&ChecklistItem>> = BTreeMap::new();
        for item in &expired {
            by_case.entry(item.case_id).or_default().push(item);
        }

        for (case_id, items) in by_case {
            let Some(case) = self.engine.store().get_case(case_id).await? else {
                continue;
            };
            let names: Vec<&str> = items.iter().map(|i| i.name.as_str()).collect();
            let message = CaseMessage::new(
                NotificationType::ItemExpired,
                "Истёк срок действия обследований",
                format!("{}: {}", patient_name(&case), names.join(", ")),
            );
            self.engine.notify_user(case.doctor_id, case.id, &message).await;
            debug!("Expired {} items of case {}", items.len(), case_id);
        }
        Ok(expired.len())
    }

    /// 删除病例已不存在的文件记录及其对象
    pub async fn cleanup_orphans(&self) -> Result<usize> {
        let orphans = self.engine.store().delete_orphan_media().await?;
        for media in &orphans {
            if let Err(e) = self.engine.storage().delete_file(&media.storage_key).await {
                warn!("Failed to delete orphaned object {}: {}", media.storage_key, e);
            }
        }
        Ok(orphans.len())
    }

    /// 在手术前3天和1天提醒主刀医生，每个偏移只提醒一次
    pub async fn surgery_reminders(&self, today: NaiveDate) -> Result<usize> {
        let horizon = REMINDER_OFFSETS.iter().copied().max().unwrap_or(0);
        let surgeries = self
            .engine
            .store()
            .scheduled_surgeries_between(today, today + ChronoDuration::days(horizon))
            .await?;

        let mut sent = 0;
        for surgery in surgeries {
            let days_until = (surgery.scheduled_date - today).num_days();
            if !REMINDER_OFFSETS.contains(&days_until) {
                continue;
            }
            if !self.engine.store().record_reminder(surgery.id, days_until as i32).await? {
                debug!("Reminder {}d for surgery {} already sent", days_until, surgery.id);
                continue;
            }
            let patient = match self.engine.store().get_case(surgery.case_id).await? {
                Some(case) => patient_name(&case),
                None => format!("#{}", surgery.case_id),
            };
            let message = CaseMessage::new(
                NotificationType::SurgeryReminder,
                "Напоминание об операции",
                format!(
                    "{}: операция {} (через {} дн.)",
                    patient, surgery.scheduled_date, days_until
                ),
            );
            self.engine.notify_user(surgery.surgeon_id, surgery.case_id, &message).await;
            sent += 1;
        }
        Ok(sent)
    }

    /// 运行直到取消；正在执行的任务会先完成
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Sweeper started, tick {:?}, jobs {:?}",
            self.tick,
            self.schedule
                .iter()
                .map(|(job, at)| format!("{}@{}", job.name(), at.format("%H:%M")))
                .collect::<Vec<_>>()
        );
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }
        info!("Sweeper stopped");
    }
}
