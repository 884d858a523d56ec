//! Model catalog and model-name handling.
//!
//! User-facing model names carry optional capability suffixes (`-image`,
//! `-video`, `-search`), in any combination. The base name maps to the
//! upstream modelId where one is known.

/// Base text models offered without the Flow collaborator.
pub const BASE_MODELS: &[&str] = &[
    "gemini-2.5-flash",
    "gemini-2.5-pro",
    "gemini-3-pro-preview",
    "gemini-3-pro",
    "gemini-3-flash-preview",
    "gemini-3-flash",
    "gemini-2.5-flash-preview-latest",
];

pub const MODEL_SUFFIXES: &[&str] = &["-image", "-video", "-search"];

/// Model names served by the Flow collaborator. Recognized even when the
/// collaborator is absent so requests for them fail clearly instead of
/// being forwarded upstream.
pub const FLOW_MODELS: &[&str] = &[
    "gemini-2.5-flash-image-landscape",
    "gemini-2.5-flash-image-portrait",
    "gemini-3.0-pro-image-landscape",
    "gemini-3.0-pro-image-portrait",
    "imagen-4.0-generate-preview-landscape",
    "imagen-4.0-generate-preview-portrait",
    "veo_3_1_t2v_fast_portrait",
    "veo_3_1_t2v_fast_landscape",
    "veo_2_1_fast_d_15_t2v_portrait",
    "veo_2_1_fast_d_15_t2v_landscape",
    "veo_2_0_t2v_portrait",
    "veo_2_0_t2v_landscape",
    "veo_3_1_i2v_s_fast_fl_portrait",
    "veo_3_1_i2v_s_fast_fl_landscape",
    "veo_2_1_fast_d_15_i2v_portrait",
    "veo_2_1_fast_d_15_i2v_landscape",
    "veo_2_0_i2v_portrait",
    "veo_2_0_i2v_landscape",
    "veo_3_0_r2v_fast_portrait",
    "veo_3_0_r2v_fast_landscape",
];

pub fn is_flow_model(model: &str) -> bool {
    FLOW_MODELS.contains(&model)
}

/// Base names with a known upstream modelId. Other bases omit
/// `assistGenerationConfig` and let the upstream pick.
const MODEL_ID_MAPPING: &[(&str, &str)] = &[
    ("gemini-2.5-flash", "gemini-2.5-flash"),
    ("gemini-2.5-pro", "gemini-2.5-pro"),
    ("gemini-3-pro-preview", "gemini-3-pro-preview"),
    ("gemini-3-pro", "gemini-3-pro"),
];

/// Capability flags encoded in the requested model name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelFlags {
    pub image: bool,
    pub video: bool,
    pub search: bool,
}

impl ModelFlags {
    pub const fn any(self) -> bool {
        self.image || self.video || self.search
    }
}

/// Strip capability suffixes from the requested model, returning the base
/// name and the flags.
pub fn split_model(model: &str) -> (String, ModelFlags) {
    let flags = ModelFlags {
        image: model.contains("-image"),
        video: model.contains("-video"),
        search: model.contains("-search"),
    };
    let base = model.replace("-image", "").replace("-video", "").replace("-search", "");
    (base, flags)
}

pub fn upstream_model_id(base: &str) -> Option<&'static str> {
    MODEL_ID_MAPPING.iter().find(|(name, _)| *name == base).map(|(_, id)| *id)
}

/// Full user-facing catalog: every base crossed with every single suffix.
/// Flow models are appended by the caller when that collaborator is wired.
pub fn available_models() -> Vec<String> {
    let mut models = Vec::with_capacity(BASE_MODELS.len() * (1 + MODEL_SUFFIXES.len()));
    for base in BASE_MODELS {
        models.push((*base).to_string());
        for suffix in MODEL_SUFFIXES {
            models.push(format!("{}{}", base, suffix));
        }
    }
    models
}

pub fn is_known_model(model: &str, flow_models: &[String]) -> bool {
    available_models().iter().any(|m| m == model) || flow_models.iter().any(|m| m == model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_model_extracts_all_suffixes() {
        let (base, flags) = split_model("gemini-2.5-flash-image-search");
        assert_eq!(base, "gemini-2.5-flash");
        assert!(flags.image);
        assert!(flags.search);
        assert!(!flags.video);

        let (base, flags) = split_model("gemini-3-pro");
        assert_eq!(base, "gemini-3-pro");
        assert!(!flags.any());
    }

    #[test]
    fn catalog_is_the_suffix_cross_product() {
        let models = available_models();
        assert_eq!(models.len(), BASE_MODELS.len() * 4);
        assert!(models.contains(&"gemini-2.5-flash".to_string()));
        assert!(models.contains(&"gemini-2.5-flash-video".to_string()));
        assert!(models.contains(&"gemini-2.5-flash-preview-latest-search".to_string()));
    }

    #[test]
    fn mapping_covers_only_stable_bases() {
        assert_eq!(upstream_model_id("gemini-2.5-pro"), Some("gemini-2.5-pro"));
        assert_eq!(upstream_model_id("gemini-3-flash"), None);
    }
}
