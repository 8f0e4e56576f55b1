//! 检查清单模板目录
//!
//! 每种手术类型的模板 = 通用部分（12项，sort_order 1..12）+ 专科部分（13..n）。
//! 纯函数，无副作用。

use oculus_core::models::ChecklistCategory::{Consultation, Imaging, Laboratory, Other};
use oculus_core::models::{ChecklistCategory, OperationType};
use serde::Serialize;

/// 模板条目
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TemplateEntry {
    pub name: &'static str,
    pub description: &'static str,
    pub category: ChecklistCategory,
    pub is_required: bool,
    /// 有效天数，0表示永不过期
    pub expires_in_days: i64,
    pub sort_order: i32,
}

const fn entry(
    sort_order: i32,
    name: &'static str,
    description: &'static str,
    category: ChecklistCategory,
    is_required: bool,
    expires_in_days: i64,
) -> TemplateEntry {
    TemplateEntry {
        name,
        description,
        category,
        is_required,
        expires_in_days,
        sort_order,
    }
}

const COMMON_BLOCK: [TemplateEntry; 12] = [
    entry(1, "Общий анализ крови", "Развёрнутый, с лейкоцитарной формулой и СОЭ", Laboratory, true, 14),
    entry(2, "Биохимический анализ крови", "Глюкоза, креатинин, мочевина, билирубин, АЛТ, АСТ", Laboratory, true, 14),
    entry(3, "Коагулограмма", "ПТИ, МНО, АЧТВ, фибриноген", Laboratory, true, 14),
    entry(4, "Общий анализ мочи", "", Laboratory, true, 14),
    entry(5, "Анализ крови на ВИЧ", "", Laboratory, true, 90),
    entry(6, "Анализ крови на сифилис (RW)", "", Laboratory, true, 90),
    entry(7, "Маркеры гепатитов B и C", "HBsAg, anti-HCV", Laboratory, true, 90),
    entry(8, "ЭКГ с расшифровкой", "", Imaging, true, 30),
    entry(9, "Флюорография", "Или рентгенография органов грудной клетки", Imaging, true, 365),
    entry(10, "Заключение терапевта", "Об отсутствии противопоказаний к операции", Consultation, true, 30),
    entry(11, "Санация полости рта", "Справка стоматолога", Consultation, true, 180),
    entry(12, "Заключение эндокринолога", "При сахарном диабете", Consultation, false, 30),
];

const PHACO_TAIL: [TemplateEntry; 3] = [
    entry(13, "Оптическая биометрия", "Длина оси глаза, глубина передней камеры", Imaging, false, 0),
    entry(14, "Кератометрия", "", Imaging, false, 0),
    entry(15, "Расчёт оптической силы ИОЛ", "", Other, false, 0),
];

const ANTIGLAUCOMA_TAIL: [TemplateEntry; 4] = [
    entry(13, "Тонометрия", "Внутриглазное давление", Other, false, 7),
    entry(14, "Периметрия", "Компьютерная, поля зрения", Imaging, false, 90),
    entry(15, "Гониоскопия", "", Other, false, 0),
    entry(16, "ОКТ диска зрительного нерва", "", Imaging, false, 90),
];

const VITRECTOMY_TAIL: [TemplateEntry; 3] = [
    entry(13, "УЗИ глазного яблока (B-скан)", "", Imaging, false, 30),
    entry(14, "ОКТ макулярной зоны", "", Imaging, false, 30),
    entry(15, "Электроретинография", "", Other, false, 90),
];

/// 通用部分
pub fn common_block() -> &'static [TemplateEntry] {
    &COMMON_BLOCK
}

/// 手术类型对应的完整模板，按sort_order排序
pub fn templates_for(operation_type: OperationType) -> Vec<TemplateEntry> {
    let tail: &[TemplateEntry] = match operation_type {
        OperationType::Phaco => &PHACO_TAIL,
        OperationType::Antiglaucoma => &ANTIGLAUCOMA_TAIL,
        OperationType::Vitrectomy => &VITRECTOMY_TAIL,
    };
    COMMON_BLOCK.iter().chain(tail.iter()).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_block_shape() {
        let common = common_block();
        assert_eq!(common.len(), 12);
        assert_eq!(common.iter().filter(|e| e.is_required).count(), 11);
        let orders: Vec<i32> = common.iter().map(|e| e.sort_order).collect();
        assert_eq!(orders, (1..=12).collect::<Vec<_>>());
    }

    #[test]
    fn test_templates_are_ordered_and_unique() {
        for op in OperationType::all() {
            let entries = templates_for(op);
            let tail = entries.len() - 12;
            assert!((3..=4).contains(&tail), "{:?} tail = {}", op, tail);
            assert!(entries.windows(2).all(|w| w[0].sort_order + 1 == w[1].sort_order));
            let mut names: Vec<&str> = entries.iter().map(|e| e.name).collect();
            names.sort_unstable();
            names.dedup();
            assert_eq!(names.len(), entries.len());
        }
    }

    #[test]
    fn test_phaco_has_at_least_fourteen_entries() {
        assert!(templates_for(OperationType::Phaco).len() >= 14);
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(
            templates_for(OperationType::Vitrectomy),
            templates_for(OperationType::Vitrectomy)
        );
    }
}
