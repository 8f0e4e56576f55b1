//! 病例摘要PDF
//!
//! 渲染器通过 [`PdfRenderer`] 接入；内置的 [`TextPdfRenderer`] 生成单页文本PDF，
//! 只使用标准Helvetica字体，西里尔字母按ICAO规则音译为拉丁字母。

use crate::engine::WorkflowEngine;
use crate::rbac::Caller;
use crate::readiness::items_ready;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use oculus_core::models::{ChecklistItem, ChecklistStatus, PatientCase, Surgery};
use oculus_core::{OculusError, Result};
use serde::Serialize;
use std::fmt::Write as _;
use tracing::debug;

/// 单页可容纳的文本行数
const MAX_LINES: usize = 54;

/// 摘要内容
#[derive(Debug, Clone, Serialize)]
pub struct CaseSummary {
    #[serde(rename = "case")]
    pub case: PatientCase,
    pub checklist: Vec<ChecklistItem>,
    pub surgery: Option<Surgery>,
    pub ready: bool,
    pub generated_at: DateTime<Utc>,
}

#[async_trait]
pub trait PdfRenderer: Send + Sync {
    async fn render_case_summary(&self, summary: &CaseSummary) -> Result<Bytes>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TextPdfRenderer;

impl TextPdfRenderer {
    pub fn lines(summary: &CaseSummary) -> Vec<String> {
        let case = &summary.case;
        let mut full_name = format!("{} {}", case.last_name, case.first_name);
        if let Some(middle) = &case.middle_name {
            full_name.push(' ');
            full_name.push_str(middle);
        }
        let mut lines = vec![
            format!("Case summary #{}", case.id),
            format!("Generated: {}", summary.generated_at.format("%d.%m.%Y %H:%M UTC")),
            String::new(),
            format!("Patient: {}", full_name),
            format!("Operation: {}, eye {}", case.operation_type.as_str(), case.eye.as_str()),
            format!("Status: {}", case.status),
            format!("Ready for surgery: {}", if summary.ready { "yes" } else { "no" }),
        ];
        if let Some(diagnosis) = &case.diagnosis {
            lines.push(format!("Diagnosis: {}", diagnosis));
        }
        if let Some(surgery) = &summary.surgery {
            lines.push(format!("Surgery date: {}", surgery.scheduled_date.format("%d.%m.%Y")));
        }
        lines.push(String::new());
        lines.push("Checklist:".to_string());
        for item in &summary.checklist {
            let mark = if item.status == ChecklistStatus::Completed { "x" } else { " " };
            let required = if item.is_required { "*" } else { "" };
            lines.push(format!("[{}] {}{} ({})", mark, item.name, required, item.status));
        }
        lines.truncate(MAX_LINES);
        lines
    }

    /// 按行生成PDF文档字节
    pub fn render_lines(lines: &[String]) -> Vec<u8> {
        let mut content = String::from("BT\n/F1 11 Tf\n14 TL\n50 800 Td\n");
        for line in lines {
            let _ = writeln!(content, "({}) Tj T*", escape_text(&transliterate(line)));
        }
        content.push_str("ET\n");

        let objects = [
            "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
            "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_string(),
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 595 842] \
             /Resources << /Font << /F1 4 0 R >> >> /Contents 5 0 R >>"
                .to_string(),
            "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica /Encoding /WinAnsiEncoding >>"
                .to_string(),
            format!("<< /Length {} >>\nstream\n{}endstream", content.len(), content),
        ];

        let mut out = String::from("%PDF-1.4\n");
        let mut offsets = Vec::with_capacity(objects.len());
        for (i, body) in objects.iter().enumerate() {
            offsets.push(out.len());
            let _ = write!(out, "{} 0 obj\n{}\nendobj\n", i + 1, body);
        }
        let xref = out.len();
        let _ = write!(out, "xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1);
        for offset in offsets {
            let _ = write!(out, "{:010} 00000 n \n", offset);
        }
        let _ = write!(
            out,
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref
        );
        out.into_bytes()
    }
}

#[async_trait]
impl PdfRenderer for TextPdfRenderer {
    async fn render_case_summary(&self, summary: &CaseSummary) -> Result<Bytes> {
        let lines = Self::lines(summary);
        let pdf = tokio::task::spawn_blocking(move || Self::render_lines(&lines))
            .await
            .map_err(|e| OculusError::Internal(format!("PDF生成失败: {}", e)))?;
        Ok(Bytes::from(pdf))
    }
}

fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' | '(' | ')' => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_ascii() && !c.is_ascii_control() => out.push(c),
            _ => out.push('?'),
        }
    }
    out
}

fn transliterate(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        let lower = c.to_lowercase().next().unwrap_or(c);
        let latin = match lower {
            'а' => "a",
            'б' => "b",
            'в' => "v",
            'г' => "g",
            'д' => "d",
            'е' => "e",
            'ё' => "e",
            'ж' => "zh",
            'з' => "z",
            'и' => "i",
            'й' => "i",
            'к' => "k",
            'л' => "l",
            'м' => "m",
            'н' => "n",
            'о' => "o",
            'п' => "p",
            'р' => "r",
            'с' => "s",
            'т' => "t",
            'у' => "u",
            'ф' => "f",
            'х' => "kh",
            'ц' => "ts",
            'ч' => "ch",
            'ш' => "sh",
            'щ' => "shch",
            'ъ' => "ie",
            'ы' => "y",
            'ь' => "",
            'э' => "e",
            'ю' => "iu",
            'я' => "ia",
            _ => {
                out.push(c);
                continue;
            }
        };
        if c != lower {
            let mut chars = latin.chars();
            if let Some(first) = chars.next() {
                out.push(first.to_ascii_uppercase());
                out.push_str(chars.as_str());
            }
        } else {
            out.push_str(latin);
        }
    }
    out
}

impl WorkflowEngine {
    /// 生成病例摘要PDF，可见范围与病例详情相同
    pub async fn case_summary_pdf(&self, caller: &Caller, id: i64) -> Result<Bytes> {
        let detail = self.get_case_detail(caller, id).await?;
        let checklist = self.store().list_items(id).await?;
        let summary = CaseSummary {
            ready: items_ready(&checklist),
            case: detail.case,
            checklist,
            surgery: detail.surgery,
            generated_at: Utc::now(),
        };
        let pdf = self.pdf_renderer().render_case_summary(&summary).await?;
        debug!("Rendered summary of case {} ({} bytes)", id, pdf.len());
        Ok(pdf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{fixture, intake};
    use oculus_core::models::OperationType;

    #[test]
    fn test_transliteration_and_escaping() {
        assert_eq!(transliterate("Туяра Алексеева"), "Tuiara Alekseeva");
        assert_eq!(transliterate("Щука"), "Shchuka");
        assert_eq!(escape_text("a(b)\\ é"), "a\\(b\\)\\\\ ?");
    }

    #[test]
    fn test_render_produces_pdf_document() {
        let pdf = TextPdfRenderer::render_lines(&["Case summary #1".to_string()]);
        let text = String::from_utf8(pdf).unwrap();
        assert!(text.starts_with("%PDF-1.4\n"));
        assert!(text.ends_with("%%EOF\n"));
        assert!(text.contains("(Case summary #1) Tj T*"));

        // xref中的偏移量指向对象起始位置
        let offset: usize = text
            .lines()
            .skip_while(|l| *l != "xref")
            .nth(3)
            .unwrap()[..10]
            .parse()
            .unwrap();
        assert!(text[offset..].starts_with("1 0 obj"));
    }

    #[tokio::test]
    async fn test_case_summary_respects_scope() {
        let f = fixture().await;
        let case = f.engine.create_case(&f.doctor, intake(OperationType::Phaco)).await.unwrap();

        let pdf = f.engine.case_summary_pdf(&f.doctor, case.id).await.unwrap();
        let text = String::from_utf8_lossy(&pdf);
        assert!(text.contains("Patient: Alekseeva Tuiara"));
        assert!(text.contains("Ready for surgery: no"));

        // 外科医生在审核前看不到病例
        assert!(matches!(
            f.engine.case_summary_pdf(&f.surgeon, case.id).await,
            Err(OculusError::Permission(_))
        ));
    }
}
