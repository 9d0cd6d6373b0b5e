#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

impl Model {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

pub fn default_gemini_models() -> Vec<Model> {
    vec![
        Model::new("gemini-2.0-flash", "Gemini 2.0 Flash").with_description("Stable"),
        Model::new("gemini-2.5-flash-lite", "Gemini 2.5 Flash-Lite")
            .with_description("Lightweight, cheap, fast at scale"),
        Model::new("gemini-2.5-flash", "Gemini 2.5 Flash")
            .with_description("Fast, balanced between speed and cost"),
        Model::new("gemini-2.5-pro", "Gemini 2.5 Pro")
            .with_description("Strongest, for complex problems and heavy code"),
    ]
}

/// Looks a model up in the built-in catalog; unknown ids are still usable as-is.
pub fn find_model(id: &str) -> Option<Model> {
    let id = id.trim();
    default_gemini_models()
        .into_iter()
        .find(|model| model.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_model_is_in_the_catalog() {
        let model = find_model(DEFAULT_GEMINI_MODEL).unwrap();
        assert_eq!(model.name, "Gemini 2.5 Flash");
        assert!(find_model("gpt-4o").is_none());
    }
}
