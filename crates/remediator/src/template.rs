//! Argument templating for remediation commands using Tera
//!
//! Action arguments are fixed templates. The only values that can flow into
//! them are the alert identifier and the already-validated resource value.
//! Go-style placeholders (`{{ .resource }}`) are accepted as well, since that
//! is what people coming from Alertmanager templates tend to write.

use serde::Serialize;
use tera::{Context, Tera};

use crate::{Error, Result};

/// Variables available to argument templates.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateVars<'a> {
    pub alert: &'a str,
    pub resource: &'a str,
}

/// Convert Go template syntax to Tera syntax
///
/// - {{ .resource }} -> {{ resource }}
/// - {{.alert}} -> {{alert}}
pub fn convert_go_to_tera(template: &str) -> String {
    template.replace("{{ .", "{{ ").replace("{{.", "{{")
}

/// Compiled argument templates of one action.
#[derive(Debug, Clone, Default)]
pub struct ArgTemplates {
    tera: Tera,
    names: Vec<String>,
}

impl ArgTemplates {
    /// Compile every argument and trial-render it so that typos in variable
    /// names surface at startup instead of at remediation time.
    pub fn compile(args: &[String]) -> Result<Self> {
        let mut tera = Tera::default();
        let mut names = Vec::with_capacity(args.len());

        for (index, arg) in args.iter().enumerate() {
            let name = format!("arg{}", index);
            tera.add_raw_template(&name, &convert_go_to_tera(arg))
                .map_err(|e| Error::Template(format!("argument {} ({:?}): {}", index, arg, e)))?;
            names.push(name);
        }

        let templates = Self { tera, names };
        templates.render(&TemplateVars {
            alert: "alert",
            resource: "resource",
        })?;
        Ok(templates)
    }

    pub fn render(&self, vars: &TemplateVars<'_>) -> Result<Vec<String>> {
        let context = Context::from_serialize(vars)
            .map_err(|e| Error::Template(format!("Failed to build context: {}", e)))?;

        self.names
            .iter()
            .map(|name| {
                self.tera
                    .render(name, &context)
                    .map_err(|e| Error::Template(format!("Failed to render {}: {}", name, e)))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_go_to_tera() {
        let tests = vec![
            ("{{ .resource }}", "{{ resource }}"),
            ("{{.alert}}", "{{alert}}"),
            ("--target={{ resource }}", "--target={{ resource }}"),
            ("restart", "restart"),
        ];

        for (input, expected) in tests {
            assert_eq!(convert_go_to_tera(input), expected);
        }
    }

    #[test]
    fn test_render_arguments() {
        let args = vec![
            "/app/remediation_scripts/cleanup_disk.sh".to_string(),
            "--host={{ .resource }}".to_string(),
            "{{ alert }}".to_string(),
        ];
        let templates = ArgTemplates::compile(&args).unwrap();
        assert_eq!(templates.len(), 3);

        let rendered = templates
            .render(&TemplateVars {
                alert: "HighDiskUsage",
                resource: "app-1:9100",
            })
            .unwrap();
        assert_eq!(
            rendered,
            vec![
                "/app/remediation_scripts/cleanup_disk.sh",
                "--host=app-1:9100",
                "HighDiskUsage"
            ]
        );
    }

    #[test]
    fn test_unknown_variable_fails_at_compile() {
        let err = ArgTemplates::compile(&["{{ labels.pod }}".to_string()]).unwrap_err();
        assert!(matches!(err, Error::Template(_)));

        assert!(ArgTemplates::compile(&["{{ resource".to_string()]).is_err());
    }

    #[test]
    fn test_empty_arguments() {
        let templates = ArgTemplates::compile(&[]).unwrap();
        assert!(templates.is_empty());
        let rendered = templates
            .render(&TemplateVars {
                alert: "AppDown",
                resource: "app-1",
            })
            .unwrap();
        assert!(rendered.is_empty());
    }
}
