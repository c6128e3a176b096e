// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pre-approved message templates and the templating attached to outgoing messages.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use super::ids::{ChannelID, OrgID, TemplateID};
use crate::error::Result;

/// One component (header, body, button...) of a template translation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateComponent {
    #[serde(rename = "type")]
    pub component_type: String,
    pub name: String,
    pub content: String,
    /// Variable name (e.g. `1`) to index into the translation's variables.
    #[serde(default)]
    pub variables: BTreeMap<String, usize>,
}

/// A variable slot of a template translation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateVariable {
    #[serde(rename = "type")]
    pub var_type: String,
}

/// A template translation approved for one channel and locale.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TemplateTranslation {
    pub channel_id: ChannelID,
    pub locale: String,
    pub external_id: String,
    pub external_locale: String,
    pub namespace: String,
    pub components: Json<Vec<TemplateComponent>>,
    pub variables: Json<Vec<TemplateVariable>>,
}

impl TemplateTranslation {
    /// Renders the text preview of this translation with the given variable values.
    pub fn preview(&self, values: &[String]) -> String {
        let mut parts = Vec::new();
        for comp in &self.components.0 {
            let mut content = comp.content.clone();
            for (name, idx) in &comp.variables {
                let value = values.get(*idx).map(String::as_str).unwrap_or("");
                content = content.replace(&format!("{{{{{}}}}}", name), value);
            }
            if !content.is_empty() {
                parts.push(content);
            }
        }
        parts.join("\n\n")
    }
}

/// A template with all its translations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateID,
    pub uuid: Uuid,
    pub name: String,
    pub translations: Vec<TemplateTranslation>,
}

impl Template {
    pub fn reference(&self) -> TemplateRef {
        TemplateRef {
            uuid: self.uuid,
            name: self.name.clone(),
        }
    }

    /// Picks the translation for a channel, preferring an exact locale match, then a language
    /// match, then any of the fallback locales.
    pub fn find_translation(
        &self,
        channel_id: ChannelID,
        locales: &[&str],
    ) -> Option<&TemplateTranslation> {
        let candidates: Vec<&TemplateTranslation> = self
            .translations
            .iter()
            .filter(|t| t.channel_id == channel_id)
            .collect();

        for locale in locales {
            if let Some(t) = candidates.iter().find(|t| t.locale == *locale) {
                return Some(t);
            }
            let lang = locale.split('-').next().unwrap_or(locale);
            if let Some(t) = candidates
                .iter()
                .find(|t| t.locale.split('-').next() == Some(lang))
            {
                return Some(t);
            }
        }
        None
    }
}

/// A template as referenced by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRef {
    pub uuid: Uuid,
    pub name: String,
}

/// A component of the templating attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplatingComponent {
    #[serde(rename = "type")]
    pub component_type: String,
    pub name: String,
    pub variables: BTreeMap<String, usize>,
}

/// A resolved variable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplatingVariable {
    #[serde(rename = "type")]
    pub var_type: String,
    pub value: String,
}

/// Everything the courier needs to send a message as a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgTemplating {
    pub template: TemplateRef,
    pub namespace: String,
    pub external_id: String,
    pub language: String,
    pub components: Vec<TemplatingComponent>,
    pub variables: Vec<TemplatingVariable>,
}

impl MsgTemplating {
    /// Builds the templating for a translation and evaluated variable values.
    pub fn new(template: &Template, translation: &TemplateTranslation, values: &[String]) -> Self {
        let components = translation
            .components
            .0
            .iter()
            .map(|c| TemplatingComponent {
                component_type: c.component_type.clone(),
                name: c.name.clone(),
                variables: c.variables.clone(),
            })
            .collect();

        let variables = translation
            .variables
            .0
            .iter()
            .enumerate()
            .map(|(i, v)| TemplatingVariable {
                var_type: v.var_type.clone(),
                value: values.get(i).cloned().unwrap_or_default(),
            })
            .collect();

        Self {
            template: template.reference(),
            namespace: translation.namespace.clone(),
            external_id: translation.external_id.clone(),
            language: translation.external_locale.clone(),
            components,
            variables,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TemplateRow {
    id: TemplateID,
    uuid: Uuid,
    name: String,
    translations: Json<Vec<TranslationJson>>,
}

#[derive(Deserialize)]
struct TranslationJson {
    channel_id: ChannelID,
    locale: String,
    external_id: String,
    external_locale: String,
    namespace: String,
    components: Vec<TemplateComponent>,
    variables: Vec<TemplateVariable>,
}

/// Loads the templates of an org with their approved translations.
pub async fn load_templates(pool: &PgPool, org_id: OrgID) -> Result<Vec<Template>> {
    let rows = sqlx::query_as::<_, TemplateRow>(
        r#"
        SELECT t.id, t.uuid, t.name, COALESCE(
            jsonb_agg(jsonb_build_object(
                'channel_id', tt.channel_id, 'locale', tt.locale, 'external_id', tt.external_id,
                'external_locale', tt.external_locale, 'namespace', tt.namespace,
                'components', tt.components, 'variables', tt.variables
            ) ORDER BY tt.id) FILTER (WHERE tt.id IS NOT NULL),
            '[]'::jsonb
        ) AS translations
        FROM templates t
        LEFT JOIN template_translations tt ON tt.template_id = t.id AND tt.status = 'A'
        WHERE t.org_id = $1 AND t.is_active
        GROUP BY t.id
        ORDER BY t.name
        "#,
    )
    .bind(org_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| Template {
            id: r.id,
            uuid: r.uuid,
            name: r.name,
            translations: r
                .translations
                .0
                .into_iter()
                .map(|t| TemplateTranslation {
                    channel_id: t.channel_id,
                    locale: t.locale,
                    external_id: t.external_id,
                    external_locale: t.external_locale,
                    namespace: t.namespace,
                    components: Json(t.components),
                    variables: Json(t.variables),
                })
                .collect(),
        })
        .collect())
}
