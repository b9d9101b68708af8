use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use crate::crawler::template::{is_xpath, DetailTemplate, FieldKind, FieldSpec, TemplateError};

/// Values pulled out of a detail page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedFields {
    pub values: Map<String, Value>,
    /// Absolute image URLs, in page order, deduplicated
    pub images: Vec<String>,
}

/// Turns a detail page into named fields
pub trait FieldExtractor: Send + Sync {
    fn extract(&self, html: &str, template: &DetailTemplate, page_url: &str)
        -> Result<ExtractedFields, TemplateError>;
}

/// CSS selector extractor; XPath fields are skipped
#[derive(Debug, Clone, Copy, Default)]
pub struct CssFieldExtractor;

fn parse_selector(selector: &str) -> Result<Selector, TemplateError> {
    Selector::parse(selector).map_err(|e| TemplateError::Selector {
        selector: selector.to_string(),
        message: format!("{e:?}"),
    })
}

fn clean_text(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_value(element: ElementRef<'_>, field: &FieldSpec) -> Option<String> {
    // Image fields read their source attribute unless an explicit one is given
    let kind = match field.kind {
        FieldKind::Text | FieldKind::Html if field.is_image() => FieldKind::Image,
        kind => kind,
    };

    let value = match kind {
        FieldKind::Text => Some(clean_text(element)),
        FieldKind::Html => Some(element.inner_html().trim().to_string()),
        FieldKind::Attribute => {
            let attr = field.attribute.as_deref().unwrap_or("href");
            element.value().attr(attr).map(|v| v.trim().to_string())
        }
        FieldKind::Image => {
            let attr = field.attribute.as_deref().unwrap_or("src");
            element
                .value()
                .attr(attr)
                .or_else(|| element.value().attr("data-src"))
                .map(|v| v.trim().to_string())
        }
    };
    value.filter(|v| !v.is_empty())
}

impl FieldExtractor for CssFieldExtractor {
    fn extract(&self, html: &str, template: &DetailTemplate, page_url: &str)
        -> Result<ExtractedFields, TemplateError>
    {
        let document = Html::parse_document(html);
        let base_url = Url::parse(page_url).ok();

        let root = match template.base_selector.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(base) => {
                let selector = parse_selector(base)?;
                document.select(&selector).next().unwrap_or_else(|| document.root_element())
            }
            None => document.root_element(),
        };

        let mut extracted = ExtractedFields::default();

        for field in &template.fields {
            if is_xpath(&field.selector) {
                debug!(field = %field.name, "Skipping XPath field");
                continue;
            }

            let selector = parse_selector(&field.selector)?;
            let mut values: Vec<String> = root
                .select(&selector)
                .filter_map(|el| element_value(el, field))
                .collect();

            if field.is_image() {
                if let Some(base) = &base_url {
                    values = values
                        .into_iter()
                        .filter_map(|v| base.join(&v).ok().map(|u| u.to_string()))
                        .collect();
                }
                for url in &values {
                    if !extracted.images.contains(url) {
                        extracted.images.push(url.clone());
                    }
                }
            }

            if values.is_empty() {
                continue;
            }

            let value = if field.multiple || field.is_image() {
                Value::from(values)
            } else {
                Value::from(values.swap_remove(0))
            };
            extracted.values.insert(field.name.clone(), value);
        }

        if !template.fields.is_empty() && extracted.values.is_empty() {
            return Err(TemplateError::NothingExtracted);
        }

        Ok(extracted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::template::FieldSpec;

    fn field(name: &str, selector: &str, kind: FieldKind) -> FieldSpec {
        FieldSpec {
            name: name.to_string(),
            selector: selector.to_string(),
            kind,
            attribute: None,
            multiple: false,
        }
    }

    const PAGE: &str = r#"
        <html><head><title>Piso en venta</title></head><body>
          <main>
            <h1>  Piso en   Chamberí </h1>
            <span class="price">450.000 €</span>
            <ul class="features"><li>3 hab.</li><li>2 baños</li></ul>
            <div class="gallery">
              <img src="/img/1.jpg"><img data-src="https://cdn.example.com/2.webp"><img src="/img/1.jpg">
            </div>
            <a class="agency" href="/agencia/9">Agencia</a>
          </main>
        </body></html>
    "#;

    #[test]
    fn test_extract_fields() {
        let mut features = field("features", "ul.features li", FieldKind::Text);
        features.multiple = true;

        let template = DetailTemplate {
            name: Some("flat".into()),
            base_selector: Some("main".into()),
            fields: vec![
                field("title", "h1", FieldKind::Text),
                field("price", ".price", FieldKind::Text),
                features,
                field("agency", "a.agency", FieldKind::Attribute),
                field("img", ".gallery img", FieldKind::Text),
                field("surface", "//span[@class='m2']", FieldKind::Text),
                field("missing", ".nope", FieldKind::Text),
            ],
            reveal_selectors: vec![],
        };

        let out = CssFieldExtractor
            .extract(PAGE, &template, "https://example.com/inmueble/1")
            .unwrap();

        assert_eq!(out.values["title"], "Piso en Chamberí");
        assert_eq!(out.values["price"], "450.000 €");
        assert_eq!(out.values["features"], serde_json::json!(["3 hab.", "2 baños"]));
        assert_eq!(out.values["agency"], "/agencia/9");
        assert!(!out.values.contains_key("surface"));
        assert!(!out.values.contains_key("missing"));

        // "img" fields are images regardless of declared type, resolved and deduplicated
        assert_eq!(
            out.images,
            vec![
                "https://example.com/img/1.jpg".to_string(),
                "https://cdn.example.com/2.webp".to_string(),
            ]
        );
    }

    #[test]
    fn test_nothing_extracted_is_an_error() {
        let template = DetailTemplate {
            name: None,
            base_selector: None,
            fields: vec![field("title", "h1.absent", FieldKind::Text)],
            reveal_selectors: vec![],
        };

        let err = CssFieldExtractor
            .extract("<html><body>Just a page</body></html>", &template, "https://example.com/")
            .unwrap_err();
        assert!(matches!(err, TemplateError::NothingExtracted));
    }

    #[test]
    fn test_invalid_selector() {
        let template = DetailTemplate {
            name: None,
            base_selector: None,
            fields: vec![field("title", "h1[", FieldKind::Text)],
            reveal_selectors: vec![],
        };

        let err = CssFieldExtractor.extract(PAGE, &template, "https://example.com/").unwrap_err();
        assert!(matches!(err, TemplateError::Selector { .. }));
    }
}
