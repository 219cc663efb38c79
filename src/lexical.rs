//! Tokenization into Postgres `tsvector` text and word-embedding context vectors.
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Positions above this are clamped; Postgres rejects larger tsvector positions.
const MAX_POSITION: usize = 16383;
/// Longest lexeme Postgres accepts in a tsvector.
pub const MAX_LEXEME_BYTES: usize = 2047;
/// Postgres caps a whole tsvector just below 1 MB; tokens past the cap are dropped.
pub const MAX_TSVECTOR_BYTES: usize = 1_048_575;
/// Words kept from each per-language embedding file.
pub const MAX_EMBEDDING_WORDS: usize = 400_000;

const ENGLISH_STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "he", "in", "is",
    "it", "its", "of", "on", "or", "that", "the", "to", "was", "were", "will", "with",
];

fn is_stopword(lang: &str, token: &str) -> bool {
    lang == "en" && ENGLISH_STOPWORDS.contains(&token)
}

/// Very small English stemmer; other languages are only lowercased.
fn lemma(lang: &str, token: &str) -> String {
    if lang != "en" || token.len() <= 3 {
        return token.to_string();
    }
    if let Some(stem) = token.strip_suffix("ies") {
        format!("{stem}y")
    } else if token.ends_with("ss") || token.ends_with("us") {
        token.to_string()
    } else if let Some(stem) = token.strip_suffix('s') {
        stem.to_string()
    } else {
        token.to_string()
    }
}

/// Lemmatizes `text` into `lexeme:position` pairs, e.g. `trouble:1 pyongyang:3`.
///
/// Positions count every token, so a dropped stopword leaves a gap. Lexemes longer
/// than [MAX_LEXEME_BYTES] are dropped, and output stops before [MAX_TSVECTOR_BYTES].
pub fn lemmatize(lang: &str, text: &str) -> String {
    let mut out = String::new();
    let tokens = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty());
    for (i, token) in tokens.enumerate() {
        let token = token.to_lowercase();
        if is_stopword(lang, &token) {
            continue;
        }
        let lexeme = lemma(lang, &token);
        if lexeme.len() > MAX_LEXEME_BYTES {
            tracing::debug!(bytes = lexeme.len(), "dropping oversized lexeme");
            continue;
        }
        let item = format!("{}:{}", lexeme, (i + 1).min(MAX_POSITION));
        let separator = usize::from(!out.is_empty());
        if out.len() + separator + item.len() > MAX_TSVECTOR_BYTES {
            tracing::debug!(bytes = out.len(), "tsvector size limit reached");
            break;
        }
        if separator == 1 {
            out.push(' ');
        }
        out.push_str(&item);
    }
    out
}

/// Inverse of [lemmatize]: `(position, lexeme)` pairs in position order.
fn parse_tsvector(tsv: &str) -> Vec<(usize, &str)> {
    let mut tokens: Vec<(usize, &str)> = tsv
        .split_whitespace()
        .filter_map(|item| {
            let (lexeme, positions) = item.rsplit_once(':')?;
            let lexeme = lexeme.trim_matches('\'');
            Some(
                positions
                    .split(',')
                    .filter_map(|p| p.trim_end_matches(char::is_alphabetic).parse().ok())
                    .map(|p| (p, lexeme))
                    .collect::<Vec<_>>(),
            )
        })
        .flatten()
        .collect();
    tokens.sort();
    tokens
}

#[derive(Debug, thiserror::Error)]
pub enum LexicalError {
    #[error("failed to read embeddings {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("embeddings {path} line {line}: expected {expected} dimensions, found {found}")]
    Dimension {
        path: PathBuf,
        line: usize,
        expected: usize,
        found: usize,
    },
}

/// Word vectors keyed by lexeme.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingTable {
    dim: usize,
    vectors: HashMap<String, Vec<f32>>,
}

impl EmbeddingTable {
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<f32>)>,
        S: Into<String>,
    {
        let vectors: HashMap<String, Vec<f32>> =
            pairs.into_iter().map(|(w, v)| (w.into(), v)).collect();
        let dim = vectors.values().next().map_or(0, Vec::len);
        Self { dim, vectors }
    }

    /// Loads a word2vec/fastText text file (`word v1 v2 ...` per line, optional
    /// `count dim` header), keeping at most `max_words` entries.
    pub fn load(path: &Path, max_words: Option<usize>) -> Result<Self, LexicalError> {
        let io_err = |source| LexicalError::Io {
            path: path.to_path_buf(),
            source,
        };
        let reader = BufReader::new(File::open(path).map_err(io_err)?);
        let mut table = Self::default();
        for (i, line) in reader.lines().enumerate() {
            let line = line.map_err(io_err)?;
            let mut fields = line.split_whitespace();
            let Some(word) = fields.next() else { continue };
            let values: Vec<f32> = fields.filter_map(|f| f.parse().ok()).collect();
            if i == 0 && values.len() == 1 {
                continue;
            }
            if table.dim == 0 {
                table.dim = values.len();
            } else if values.len() != table.dim {
                return Err(LexicalError::Dimension {
                    path: path.to_path_buf(),
                    line: i + 1,
                    expected: table.dim,
                    found: values.len(),
                });
            }
            table.vectors.insert(word.to_string(), values);
            if max_words.is_some_and(|max| table.vectors.len() >= max) {
                break;
            }
        }
        tracing::info!(path = %path.display(), words = table.vectors.len(), dim = table.dim, "loaded embeddings");
        Ok(table)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn get(&self, word: &str) -> Option<&[f32]> {
        self.vectors.get(word).map(Vec::as_slice)
    }
}

/// One [EmbeddingTable] per language, loaded from `{lang}.vec` files.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingSet {
    tables: HashMap<String, EmbeddingTable>,
}

impl EmbeddingSet {
    pub fn from_tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = (S, EmbeddingTable)>,
        S: Into<String>,
    {
        Self {
            tables: tables.into_iter().map(|(l, t)| (l.into(), t)).collect(),
        }
    }

    /// Loads every `*.vec` file in `dir`, keyed by file stem.
    pub fn load_dir(dir: &Path, max_words: Option<usize>) -> Result<Self, LexicalError> {
        let io_err = |source| LexicalError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut tables = HashMap::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("vec") {
                continue;
            }
            let Some(lang) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            tables.insert(lang.to_string(), EmbeddingTable::load(&path, max_words)?);
        }
        if tables.is_empty() {
            tracing::warn!(dir = %dir.display(), "no embedding files found");
        }
        Ok(Self { tables })
    }

    pub fn get(&self, lang: &str) -> Option<&EmbeddingTable> {
        self.tables.get(lang)
    }

    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextVector {
    pub focus: String,
    /// Sum of the neighbouring embeddings divided by `sqrt(count)`.
    pub vector: Vec<f32>,
    /// Number of neighbouring embeddings that were summed.
    pub count: usize,
}

/// Context vectors for every lexeme of a lemmatized document.
///
/// The context of a focus lexeme is the sum of the embeddings of all lexemes at most
/// `window` positions away, accumulated over every occurrence of the focus.
pub fn context_vectors(table: &EmbeddingTable, tsv: &str, window: usize) -> Vec<ContextVector> {
    if table.is_empty() {
        return vec![];
    }
    let tokens = parse_tsvector(tsv);
    let mut sums: BTreeMap<&str, (Vec<f32>, usize)> = BTreeMap::new();
    for (i, &(position, focus)) in tokens.iter().enumerate() {
        let lo = i.saturating_sub(window * 2);
        let hi = (i + window * 2 + 1).min(tokens.len());
        for (j, &(other_position, word)) in tokens.iter().enumerate().take(hi).skip(lo) {
            if j == i || position.abs_diff(other_position) > window {
                continue;
            }
            let Some(embedding) = table.get(word) else { continue };
            let (sum, count) = sums
                .entry(focus)
                .or_insert_with(|| (vec![0.0; table.dim()], 0));
            for (s, e) in sum.iter_mut().zip(embedding) {
                *s += e;
            }
            *count += 1;
        }
    }
    sums.into_iter()
        .map(|(focus, (sum, count))| {
            let norm = (count as f32).sqrt();
            ContextVector {
                focus: focus.to_string(),
                vector: sum.into_iter().map(|x| x / norm).collect(),
                count,
            }
        })
        .collect()
}
