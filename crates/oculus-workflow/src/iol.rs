//! 人工晶体（IOL）屈光力计算
//!
//! 公式是可替换的纯函数，仅用于术前参考。

use oculus_core::{OculusError, Result};
use serde::{Deserialize, Serialize};

/// 计算输入
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IolInput {
    /// 眼轴长度，毫米
    pub axial_length_mm: f64,
    /// 平均角膜曲率，屈光度
    pub keratometry_d: f64,
    /// 晶体A常数
    pub a_constant: f64,
    /// 目标术后屈光，屈光度
    #[serde(default)]
    pub target_refraction_d: f64,
}

impl IolInput {
    pub fn validate(&self) -> Result<()> {
        check_range("axial_length_mm", self.axial_length_mm, 15.0, 40.0)?;
        check_range("keratometry_d", self.keratometry_d, 30.0, 60.0)?;
        check_range("a_constant", self.a_constant, 110.0, 125.0)?;
        check_range("target_refraction_d", self.target_refraction_d, -10.0, 10.0)
    }
}

fn check_range(field: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if !value.is_finite() || value < min || value > max {
        return Err(OculusError::Validation(format!(
            "{} 超出范围 [{}, {}]: {}",
            field, min, max, value
        )));
    }
    Ok(())
}

/// 计算结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IolResult {
    pub formula: &'static str,
    /// 正视所需的晶体屈光力
    pub emmetropic_power_d: f64,
    /// 达到目标屈光所需的晶体屈光力
    pub target_power_d: f64,
    pub input: IolInput,
}

/// IOL计算公式
pub trait IolFormula: Send + Sync {
    fn name(&self) -> &'static str;

    fn emmetropic_power(&self, input: &IolInput) -> f64;

    fn power_for_target(&self, input: &IolInput) -> f64;
}

/// SRK/II 回归公式
#[derive(Debug, Default, Clone, Copy)]
pub struct Srk2;

impl Srk2 {
    fn adjusted_a(&self, input: &IolInput) -> f64 {
        let l = input.axial_length_mm;
        let correction = if l < 20.0 {
            3.0
        } else if l < 21.0 {
            2.0
        } else if l < 22.0 {
            1.0
        } else if l < 24.5 {
            0.0
        } else {
            -0.5
        };
        input.a_constant + correction
    }
}

impl IolFormula for Srk2 {
    fn name(&self) -> &'static str {
        "SRK/II"
    }

    fn emmetropic_power(&self, input: &IolInput) -> f64 {
        self.adjusted_a(input) - 2.5 * input.axial_length_mm - 0.9 * input.keratometry_d
    }

    fn power_for_target(&self, input: &IolInput) -> f64 {
        let p = self.emmetropic_power(input);
        let factor = if p > 14.0 { 1.25 } else { 1.0 };
        p - factor * input.target_refraction_d
    }
}

/// 按名称选择公式，未指定时使用SRK/II
pub fn formula_by_name(name: Option<&str>) -> Result<Box<dyn IolFormula>> {
    let normalized = name
        .map(|n| n.trim().to_ascii_uppercase().replace(['/', '-', ' '], ""))
        .unwrap_or_default();
    match normalized.as_str() {
        "" | "SRK2" | "SRKII" => Ok(Box::new(Srk2)),
        _ => Err(OculusError::Validation(format!(
            "不支持的公式: {}",
            name.unwrap_or_default()
        ))),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn calculate(formula: &dyn IolFormula, input: IolInput) -> Result<IolResult> {
    input.validate()?;
    Ok(IolResult {
        formula: formula.name(),
        emmetropic_power_d: round2(formula.emmetropic_power(&input)),
        target_power_d: round2(formula.power_for_target(&input)),
        input,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(al: f64, k: f64, target: f64) -> IolInput {
        IolInput {
            axial_length_mm: al,
            keratometry_d: k,
            a_constant: 118.4,
            target_refraction_d: target,
        }
    }

    #[test]
    fn test_srk2_average_eye() {
        // 118.4 - 2.5 * 23.5 - 0.9 * 44 = 20.05
        let result = calculate(&Srk2, input(23.5, 44.0, 0.0)).unwrap();
        assert_eq!(result.emmetropic_power_d, 20.05);
        assert_eq!(result.target_power_d, 20.05);

        let myopic_target = calculate(&Srk2, input(23.5, 44.0, -1.0)).unwrap();
        assert_eq!(myopic_target.target_power_d, 21.3);
    }

    #[test]
    fn test_srk2_axial_length_corrections() {
        let short = Srk2.emmetropic_power(&input(19.5, 44.0, 0.0));
        assert!((short - (121.4 - 48.75 - 39.6)).abs() < 1e-9);
        let long = Srk2.emmetropic_power(&input(26.0, 44.0, 0.0));
        assert!((long - (117.9 - 65.0 - 39.6)).abs() < 1e-9);
    }

    #[test]
    fn test_low_power_uses_unit_factor() {
        let i = input(27.0, 46.0, -1.0);
        let p = Srk2.emmetropic_power(&i);
        assert!(p <= 14.0);
        assert!((Srk2.power_for_target(&i) - (p + 1.0)).abs() < 1e-9);
    }

    #[test]
    fn test_validation_and_formula_lookup() {
        assert!(calculate(&Srk2, input(50.0, 44.0, 0.0)).is_err());
        assert!(calculate(&Srk2, input(23.0, f64::NAN, 0.0)).is_err());
        assert_eq!(formula_by_name(Some("srk/ii")).unwrap().name(), "SRK/II");
        assert_eq!(formula_by_name(None).unwrap().name(), "SRK/II");
        assert!(formula_by_name(Some("Barrett")).is_err());
    }
}
