//! Grounded prompt construction.
//!
//! Merges the query and retrieved documents into the template registered for
//! the resolved language. The two corpora label their fields differently, so
//! document title/body extraction goes through an explicit field map keyed by
//! each document's own source language rather than a single hard-coded
//! schema.

use crate::config::QaConfig;
use crate::language::Language;
use crate::retrieval::RetrievedDocument;

/// Field names a corpus uses for document metadata.
///
/// The French corpus exports `source_document_type`/`header`/`content`, the
/// Arabic corpus chunks carry `title`/`text` with no type field.
#[derive(Debug, Clone, Copy)]
pub struct FieldMap {
    pub doc_type: Option<&'static str>,
    pub title: &'static str,
    pub body: &'static str,
}

impl FieldMap {
    pub fn for_language(language: Language) -> FieldMap {
        match language {
            Language::Fr => FieldMap {
                doc_type: Some("source_document_type"),
                title: "header",
                body: "content",
            },
            Language::Ar => FieldMap {
                doc_type: None,
                title: "title",
                body: "text",
            },
        }
    }

    pub fn title_of<'a>(&self, record: &'a serde_json::Value) -> &'a str {
        record.get(self.title).and_then(|v| v.as_str()).unwrap_or("")
    }

    pub fn body_of<'a>(&self, record: &'a serde_json::Value) -> &'a str {
        record.get(self.body).and_then(|v| v.as_str()).unwrap_or("")
    }

    pub fn doc_type_of<'a>(&self, record: &'a serde_json::Value) -> Option<&'a str> {
        self.doc_type
            .and_then(|field| record.get(field))
            .and_then(|v| v.as_str())
    }
}

const TEMPLATE_FR: &str = "\
Tu es un assistant juridique expert en droit algérien. Réponds de manière \
précise, professionnelle et factuelle en te basant strictement sur le \
contexte fourni. Si l'information n'est pas dans le contexte, indique-le \
clairement.

Contexte juridique:
{context}

Question: {query}

Réponse:";

const TEMPLATE_AR: &str = "\
أنت مساعد قانوني خبير في القانون الجزائري. أجب بدقة ومهنية واستنادًا حصريًا \
إلى السياق المقدم. إذا لم تكن المعلومة موجودة في السياق فاذكر ذلك صراحةً.

السياق القانوني:
{context}

السؤال: {query}

الإجابة (باللغة العربية، شاملة):";

// Rendered in place of the context block when retrieval came back empty; the
// generated answer must state that no specific legal source was found.
const NO_CONTEXT_FR: &str = "Aucun contexte juridique disponible. Précise dans ta réponse \
qu'aucune source juridique spécifique n'a été trouvée.";
const NO_CONTEXT_AR: &str =
    "لا يوجد سياق قانوني متاح. وضّح في إجابتك أنه لم يُعثر على مصدر قانوني محدد.";

/// The fully rendered prompt plus the inputs it was built from. Built once
/// per query and consumed once by the generation orchestrator.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub language: Language,
    pub query: String,
    pub documents: Vec<RetrievedDocument>,
    pub template_id: String,
    pub prompt: String,
}

pub struct PromptBuilder {
    config: std::sync::Arc<QaConfig>,
}

impl PromptBuilder {
    pub fn new(config: std::sync::Arc<QaConfig>) -> Self {
        Self { config }
    }

    pub fn build(
        &self,
        language: Language,
        query: &str,
        documents: Vec<RetrievedDocument>,
    ) -> PromptContext {
        let (template, template_id) = self.template_for(language);
        let context_block = format_context(language, &documents);
        let prompt = template
            .replace("{context}", &context_block)
            .replace("{query}", query);

        tracing::debug!(
            language = %language,
            template = %template_id,
            documents = documents.len(),
            prompt_len = prompt.len(),
            "Prompt built"
        );

        PromptContext {
            language,
            query: query.to_string(),
            documents,
            template_id,
            prompt,
        }
    }

    /// Configured template file if present and readable, built-in otherwise.
    fn template_for(&self, language: Language) -> (String, String) {
        if let Some(path) = &self.config.profile(language).template_path {
            match std::fs::read_to_string(path) {
                Ok(text) => {
                    let id = path
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| format!("custom_{language}"));
                    return (text, id);
                }
                Err(err) => {
                    tracing::warn!(
                        language = %language,
                        error = %err,
                        "Template file unreadable, using built-in template"
                    );
                }
            }
        }
        match language {
            Language::Fr => (TEMPLATE_FR.to_string(), "qa_with_context_fr".to_string()),
            Language::Ar => (TEMPLATE_AR.to_string(), "qa_with_context_ar".to_string()),
        }
    }
}

/// Format retrieved documents as a numbered context block, in retrieval
/// order. Field names are resolved per document through the field map.
fn format_context(language: Language, documents: &[RetrievedDocument]) -> String {
    if documents.is_empty() {
        return match language {
            Language::Fr => NO_CONTEXT_FR.to_string(),
            Language::Ar => NO_CONTEXT_AR.to_string(),
        };
    }

    let mut parts = Vec::with_capacity(documents.len());
    for (i, document) in documents.iter().enumerate() {
        let fields = FieldMap::for_language(document.source_language);
        let title = fields.title_of(&document.record);
        let body = fields.body_of(&document.record);

        let mut block = format!("--- Document {} ---\n", i + 1);
        if let Some(doc_type) = fields.doc_type_of(&document.record) {
            block.push_str(&format!("Type: {}\n", doc_type.to_uppercase()));
        }
        block.push_str(&format!("Référence: {}\n", title));
        block.push_str(&format!("Pertinence: {:.3}\n", document.similarity));
        block.push_str(&format!("Contenu:\n{}\n", body));
        parts.push(block);
    }
    parts.join("\n")
}
