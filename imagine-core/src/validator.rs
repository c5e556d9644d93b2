//! Bound checks applied to every generation request before any model work.
//!
//! Numeric parameters may arrive as JSON numbers or as query-string text, so
//! each check coerces first and range-checks second.

use serde::{Deserialize, Serialize};

use crate::{catalog::ModelConfig, error::ValidationError, model::GenerationParams};

pub const MAX_PROMPT_LENGTH: usize = 200;
pub const MAX_GUIDANCE_SCALE: f64 = 10.0;
pub const MAX_INFERENCE_STEPS: u32 = 50;
pub const DEFAULT_IMG_SIZE: u32 = 512;

/// A numeric parameter before coercion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// Integral floats and numeric strings coerce; fractional values do not.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Float(value) if value.is_finite() && value.fract() == 0.0 => Some(*value as i64),
            Self::Float(_) => None,
            Self::Text(text) => text.trim().parse().ok(),
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            Self::Text(text) => text.trim().parse().ok(),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Generation parameters as received from a caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub img_size: Option<ParamValue>,
    #[serde(default)]
    pub guidance_scale: Option<ParamValue>,
    #[serde(default)]
    pub num_inference_steps: Option<ParamValue>,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_img_size(mut self, size: impl Into<ParamValue>) -> Self {
        self.img_size = Some(size.into());
        self
    }

    pub fn with_guidance_scale(mut self, guidance: impl Into<ParamValue>) -> Self {
        self.guidance_scale = Some(guidance.into());
        self
    }

    pub fn with_steps(mut self, steps: impl Into<ParamValue>) -> Self {
        self.num_inference_steps = Some(steps.into());
        self
    }
}

pub fn validate_prompt(prompt: &str) -> Result<(), ValidationError> {
    if prompt.trim().is_empty() {
        return Err(ValidationError::EmptyPrompt);
    }
    if prompt.chars().count() > MAX_PROMPT_LENGTH {
        return Err(ValidationError::PromptTooLong {
            max: MAX_PROMPT_LENGTH,
        });
    }
    Ok(())
}

pub fn validate_image_size(config: &ModelConfig, size: &ParamValue) -> Result<u32, ValidationError> {
    let size = size
        .as_integer()
        .ok_or(ValidationError::ImageSizeNotInteger)?;
    let (min, max) = (config.min_img_size, config.max_img_size);
    if size < i64::from(min) || size > i64::from(max) {
        return Err(ValidationError::ImageSizeOutOfRange { min, max });
    }
    Ok(size as u32)
}

/// Returns `(guidance_scale, num_inference_steps)`, substituting the model's
/// defaults for absent values.
pub fn validate_generation_params(
    config: &ModelConfig,
    guidance_scale: Option<&ParamValue>,
    num_inference_steps: Option<&ParamValue>,
) -> Result<(f64, u32), ValidationError> {
    let guidance = match guidance_scale {
        Some(value) => {
            let guidance = value.as_float().ok_or(ValidationError::GuidanceNotNumber)?;
            if !guidance.is_finite() || !(0.0..=MAX_GUIDANCE_SCALE).contains(&guidance) {
                return Err(ValidationError::GuidanceOutOfRange {
                    max: MAX_GUIDANCE_SCALE,
                });
            }
            guidance
        }
        None => config.default_guidance,
    };

    let steps = match num_inference_steps {
        Some(value) => {
            let steps = value.as_integer().ok_or(ValidationError::StepsNotInteger)?;
            if !(1..=i64::from(MAX_INFERENCE_STEPS)).contains(&steps) {
                return Err(ValidationError::StepsOutOfRange {
                    max: MAX_INFERENCE_STEPS,
                });
            }
            steps as u32
        }
        None => config.default_steps,
    };

    Ok((guidance, steps))
}

/// Runs every check and produces the parameters a model receives.
pub fn validate_request(
    config: &ModelConfig,
    request: &GenerationRequest,
) -> Result<GenerationParams, ValidationError> {
    validate_prompt(&request.prompt)?;
    let size = match &request.img_size {
        Some(size) => validate_image_size(config, size)?,
        None => validate_image_size(config, &ParamValue::from(DEFAULT_IMG_SIZE))?,
    };
    let (guidance_scale, num_inference_steps) = validate_generation_params(
        config,
        request.guidance_scale.as_ref(),
        request.num_inference_steps.as_ref(),
    )?;
    Ok(GenerationParams {
        prompt: request.prompt.clone(),
        height: size,
        width: size,
        guidance_scale,
        num_inference_steps,
        seed: request.seed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sdxl() -> ModelConfig {
        ModelConfig::new(25, 7.5, 512, 1024)
    }

    #[test]
    fn prompt_bounds() {
        assert_eq!(validate_prompt(""), Err(ValidationError::EmptyPrompt));
        assert_eq!(validate_prompt(" \t\n"), Err(ValidationError::EmptyPrompt));
        assert!(validate_prompt("a").is_ok());
        assert!(validate_prompt(&"x".repeat(MAX_PROMPT_LENGTH)).is_ok());
        assert!(validate_prompt(&format!("  {}", "x".repeat(198))).is_ok());
        assert_eq!(
            validate_prompt(&"x".repeat(MAX_PROMPT_LENGTH + 1)),
            Err(ValidationError::PromptTooLong { max: 200 })
        );
    }

    #[test]
    fn prompt_length_counts_characters() {
        assert!(validate_prompt(&"é".repeat(MAX_PROMPT_LENGTH)).is_ok());
    }

    #[test]
    fn empty_prompt_message() {
        assert_eq!(
            ValidationError::EmptyPrompt.to_string(),
            "Prompt cannot be empty"
        );
    }

    #[test]
    fn image_size_is_inclusive() {
        let config = sdxl();
        for size in [512u32, 768, 1024] {
            assert_eq!(validate_image_size(&config, &size.into()), Ok(size));
        }
        for size in [0i64, 511, 1025, 2048, 4096, -512] {
            assert_eq!(
                validate_image_size(&config, &size.into()),
                Err(ValidationError::ImageSizeOutOfRange { min: 512, max: 1024 })
            );
        }
    }

    #[test]
    fn image_size_coercion() {
        let config = sdxl();
        assert_eq!(validate_image_size(&config, &"768".into()), Ok(768));
        assert_eq!(validate_image_size(&config, &" 512 ".into()), Ok(512));
        assert_eq!(validate_image_size(&config, &768.0.into()), Ok(768));
        assert_eq!(
            validate_image_size(&config, &"large".into()),
            Err(ValidationError::ImageSizeNotInteger)
        );
        assert_eq!(
            validate_image_size(&config, &600.5.into()),
            Err(ValidationError::ImageSizeNotInteger)
        );
        assert_eq!(
            ValidationError::ImageSizeOutOfRange { min: 512, max: 1024 }.to_string(),
            "Image size must be between 512 and 1024"
        );
    }

    #[test]
    fn absent_params_use_model_defaults() {
        let flux = ModelConfig::new(4, 0.0, 256, 1024);
        assert_eq!(validate_generation_params(&flux, None, None), Ok((0.0, 4)));
        assert_eq!(validate_generation_params(&sdxl(), None, None), Ok((7.5, 25)));
    }

    #[test]
    fn guidance_bounds() {
        let config = sdxl();
        for guidance in [0.0, 3.5, 10.0] {
            let (g, _) = validate_generation_params(&config, Some(&guidance.into()), None).unwrap();
            assert_eq!(g, guidance);
        }
        assert_eq!(
            validate_generation_params(&config, Some(&"7".into()), None),
            Ok((7.0, 25))
        );
        for bad in [-0.1, 10.5, f64::NAN, f64::INFINITY] {
            assert_eq!(
                validate_generation_params(&config, Some(&bad.into()), None),
                Err(ValidationError::GuidanceOutOfRange { max: 10.0 })
            );
        }
        assert_eq!(
            validate_generation_params(&config, Some(&"strong".into()), None),
            Err(ValidationError::GuidanceNotNumber)
        );
    }

    #[test]
    fn steps_bounds() {
        let config = sdxl();
        assert_eq!(
            validate_generation_params(&config, None, Some(&1i64.into())),
            Ok((7.5, 1))
        );
        assert_eq!(
            validate_generation_params(&config, None, Some(&"50".into())),
            Ok((7.5, 50))
        );
        for bad in [0i64, 51, 1000, -3] {
            assert_eq!(
                validate_generation_params(&config, None, Some(&bad.into())),
                Err(ValidationError::StepsOutOfRange { max: 50 })
            );
        }
        assert_eq!(
            validate_generation_params(&config, None, Some(&"many".into())),
            Err(ValidationError::StepsNotInteger)
        );
    }

    #[test]
    fn request_checks_prompt_before_size() {
        let request = GenerationRequest::new("").with_img_size(4096u32);
        assert_eq!(
            validate_request(&sdxl(), &request),
            Err(ValidationError::EmptyPrompt)
        );
    }

    #[test]
    fn request_resolves_params() {
        let request = GenerationRequest::new("A cat")
            .with_img_size(512u32)
            .with_guidance_scale(7.5)
            .with_steps(30u32);
        let params = validate_request(&sdxl(), &request).unwrap();
        assert_eq!(params.height, 512);
        assert_eq!(params.width, 512);
        assert_eq!(params.guidance_scale, 7.5);
        assert_eq!(params.num_inference_steps, 30);
        assert_eq!(params.seed, None);
    }

    #[test]
    fn missing_size_defaults_to_512() {
        let params = validate_request(&sdxl(), &GenerationRequest::new("ok")).unwrap();
        assert_eq!(params.height, DEFAULT_IMG_SIZE);
    }

    #[test]
    fn param_values_deserialize_from_json_and_text() {
        let request: GenerationRequest = serde_json::from_str(
            r#"{"prompt": "ok", "img_size": "768", "guidance_scale": 2, "num_inference_steps": null}"#,
        )
        .unwrap();
        assert_eq!(request.img_size, Some(ParamValue::Text("768".into())));
        assert_eq!(request.guidance_scale, Some(ParamValue::Int(2)));
        assert_eq!(request.num_inference_steps, None);
    }
}
