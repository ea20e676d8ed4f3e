use std::cell::RefCell;

use readability_js::{Readability, ReadabilityError, ReadabilityOptions};

use crate::error::ExtractionError;

pub trait TextExtractor: Send + Sync {
    /// Article text of `html`, which was served from `url`.
    fn extract(&self, html: &str, url: &str) -> Result<String, ExtractionError>;
}

thread_local! {
    static READABILITY: RefCell<Option<Readability>> = const { RefCell::new(None) };
}

/// Readability-based extraction. The JS engine is not shareable across
/// threads, so each blocking thread lazily builds its own instance.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadabilityExtractor;

impl TextExtractor for ReadabilityExtractor {
    fn extract(&self, html: &str, url: &str) -> Result<String, ExtractionError> {
        let text_err = |message: String| ExtractionError::Text {
            url: url.to_owned(),
            message,
        };
        READABILITY.with(|cell| {
            let mut slot = cell.borrow_mut();
            if slot.is_none() {
                let readability = Readability::new()
                    .map_err(|err| text_err(format!("initialize readability-js: {err:?}")))?;
                *slot = Some(readability);
            }
            let Some(readability) = slot.as_ref() else {
                return Err(text_err("readability-js unavailable".to_owned()));
            };
            extract_with_readability(readability, html, url)
                .map_err(|err| text_err(format!("{err:?}")))
        })
    }
}

fn extract_with_readability(
    readability: &Readability,
    html: &str,
    url: &str,
) -> Result<String, ReadabilityError> {
    match readability.parse_with_url(html, url) {
        Ok(article) => Ok(html2md::parse_html(&article.content)),
        Err(ReadabilityError::ReadabilityCheckFailed) => {
            let options = ReadabilityOptions::new()
                .char_threshold(0)
                .nb_top_candidates(10)
                .link_density_modifier(2.0);
            let article = readability.parse_with_options(html, Some(url), Some(options))?;
            Ok(html2md::parse_html(&article.content))
        }
        Err(err) => Err(err),
    }
}

/// Character count of `content` with every run of newlines collapsed to
/// one, which is what the minimum-length gate measures.
pub fn normalized_length(content: &str) -> usize {
    let mut count = 0;
    let mut previous_newline = false;
    for ch in content.chars() {
        let is_newline = ch == '\n';
        if !(is_newline && previous_newline) {
            count += 1;
        }
        previous_newline = is_newline;
    }
    count
}

/// Whether `content` clears a minimum of `min_length` normalized characters.
pub fn passes_length_gate(content: &str, min_length: usize) -> bool {
    normalized_length(content) > min_length
}
