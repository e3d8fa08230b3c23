//! Page-level TF-IDF retrieval over the knowledge directory.
//!
//! Documents are PDFs, read page by page. A `.txt` with pages separated by
//! form feeds (`pdftotext` output) stands in for a PDF that has no text
//! layer or cannot be parsed, and is indexed on its own when there is no
//! PDF. Each non-blank page is one retrievable chunk that cites back to the
//! document and page number.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use llminister_core::Source;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("cannot read knowledge file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot extract text from {}: {reason}", path.display())]
    Pdf { path: PathBuf, reason: String },
}

/// The files found for one document stem.
#[derive(Default)]
struct DocumentFiles {
    pdf: Option<PathBuf>,
    txt: Option<PathBuf>,
}

/// One page of a knowledge document.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub title: String,
    /// 1-based.
    pub page: u32,
    pub file_path: String,
    pub content: String,
}

/// A search result: a citable source and the page it points at.
#[derive(Debug, Clone)]
pub struct Hit<'a> {
    pub source: Source,
    pub page: &'a Page,
}

type SparseVec = HashMap<String, f32>;

pub struct KnowledgeBase {
    pages: Vec<Page>,
    vectors: Vec<SparseVec>,
    idf: HashMap<String, f32>,
}

// ── Loading ──

impl KnowledgeBase {
    /// Load every document in `dir`. A missing directory gives an empty
    /// knowledge base; a document that yields no text is skipped with a
    /// warning.
    pub async fn load(dir: &Path) -> Result<Self, KnowledgeError> {
        let io_err = |source| KnowledgeError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(dir = %dir.display(), "knowledge directory does not exist");
                return Ok(Self::from_pages(Vec::new()));
            }
            Err(e) => return Err(io_err(e)),
        };

        let mut documents: BTreeMap<PathBuf, DocumentFiles> = BTreeMap::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            let stem = path.with_extension("");
            match path.extension().and_then(|ext| ext.to_str()) {
                Some("pdf") => documents.entry(stem).or_default().pdf = Some(path),
                Some("txt") => documents.entry(stem).or_default().txt = Some(path),
                _ => {}
            }
        }

        let mut pages = Vec::new();
        for (stem, files) in documents {
            let loaded = load_document(files).await?;
            if loaded.is_empty() {
                debug!(document = %stem.display(), "no text pages, skipped");
            }
            pages.extend(loaded);
        }
        let kb = Self::from_pages(pages);
        info!(dir = %dir.display(), pages = kb.len(), "knowledge base loaded");
        Ok(kb)
    }

    pub fn from_pages(pages: Vec<Page>) -> Self {
        let tokenized: Vec<Vec<String>> = pages.iter().map(|p| tokenize(&p.content)).collect();

        let mut df: HashMap<&str, usize> = HashMap::new();
        for tokens in &tokenized {
            let mut seen: Vec<&str> = tokens.iter().map(String::as_str).collect();
            seen.sort_unstable();
            seen.dedup();
            for term in seen {
                *df.entry(term).or_default() += 1;
            }
        }
        // Smoothed idf: ln((1 + n) / (1 + df)) + 1.
        let n = pages.len() as f32;
        let idf: HashMap<String, f32> = df
            .into_iter()
            .map(|(term, count)| (term.to_string(), ((1.0 + n) / (1.0 + count as f32)).ln() + 1.0))
            .collect();

        let vectors = tokenized.iter().map(|tokens| weigh(tokens, &idf)).collect();
        Self {
            pages,
            vectors,
            idf,
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Look up a page by document title and page number.
    pub fn page(&self, title: &str, page: u32) -> Option<&Page> {
        self.pages.iter().find(|p| p.title == title && p.page == page)
    }
}

// ── Search ──

impl KnowledgeBase {
    /// The `top_k` pages most similar to `query`, best first, as sources
    /// `S1..Sk`. Pages sharing no terms with the query are never returned.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<Hit<'_>> {
        let query_vec = weigh(&tokenize(query), &self.idf);
        if query_vec.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, cosine_sim(&query_vec, v)))
            .filter(|&(_, score)| score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(top_k);

        scored
            .into_iter()
            .enumerate()
            .map(|(rank, (i, score))| {
                let page = &self.pages[i];
                Hit {
                    source: Source {
                        id: format!("S{}", rank + 1),
                        title: page.title.clone(),
                        page: page.page,
                        file_path: page.file_path.clone(),
                        similarity_score: score,
                    },
                    page,
                }
            })
            .collect()
    }
}

/// Pages of one document: the PDF's own text when it has any, otherwise
/// the `.txt` extraction.
async fn load_document(files: DocumentFiles) -> Result<Vec<Page>, KnowledgeError> {
    if let Some(pdf) = &files.pdf {
        match read_pdf(pdf).await {
            Ok(pages) if !pages.is_empty() => return Ok(pages),
            Ok(_) if files.txt.is_none() => {
                warn!(path = %pdf.display(), "PDF has no text layer");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "falling back to text extraction"),
        }
    }
    let Some(txt) = files.txt else {
        return Ok(Vec::new());
    };
    let text = tokio::fs::read_to_string(&txt)
        .await
        .map_err(|source| KnowledgeError::Io {
            path: txt.clone(),
            source,
        })?;
    let cited = files.pdf.unwrap_or_else(|| txt.clone());
    Ok(pages_of(&cited, text.split('\u{0c}')))
}

async fn read_pdf(path: &Path) -> Result<Vec<Page>, KnowledgeError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| KnowledgeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let pdf_err = |reason: String| KnowledgeError::Pdf {
        path: path.to_path_buf(),
        reason,
    };
    // Text extraction is CPU-bound.
    let texts = tokio::task::spawn_blocking(move || {
        pdf_extract::extract_text_from_mem_by_pages(&bytes).map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| pdf_err(e.to_string()))?
    .map_err(pdf_err)?;
    Ok(pages_of(path, texts.iter().map(String::as_str)))
}

/// Number the page texts from 1 and keep the non-blank ones.
fn pages_of<'a>(cited: &Path, texts: impl Iterator<Item = &'a str>) -> Vec<Page> {
    let title = cited
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_path = cited.display().to_string();

    texts
        .enumerate()
        .filter(|(_, content)| !content.trim().is_empty())
        .map(|(i, content)| Page {
            title: title.clone(),
            page: i as u32 + 1,
            file_path: file_path.clone(),
            content: content.trim().to_string(),
        })
        .collect()
}

/// Common Dutch function words, excluded from the index.
const STOPWORDS: &[&str] = &[
    "aan", "al", "als", "bij", "dan", "dat", "de", "der", "des", "deze", "die", "dit", "door",
    "een", "en", "er", "het", "hij", "hoe", "ik", "in", "is", "je", "kan", "maar", "met", "na",
    "naar", "niet", "nog", "of", "om", "onder", "ook", "op", "over", "te", "tot", "uit", "van",
    "voor", "was", "wat", "we", "wel", "wij", "worden", "wordt", "zal", "ze", "zich", "zijn",
    "zo", "zou",
];

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1)
        .map(str::to_lowercase)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Term-frequency × idf weights, L2-normalized. Terms unknown to the index are dropped.
fn weigh(tokens: &[String], idf: &HashMap<String, f32>) -> SparseVec {
    let mut v = SparseVec::new();
    for token in tokens {
        if let Some(w) = idf.get(token) {
            *v.entry(token.clone()).or_default() += w;
        }
    }
    let norm: f32 = v.values().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.values_mut() {
            *x /= norm;
        }
    }
    v
}

fn cosine_sim(a: &SparseVec, b: &SparseVec) -> f32 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .filter_map(|(term, x)| large.get(term).map(|y| x * y))
        .sum()
}
