//! Noun-chunk prefix augmentation.
//!
//! Articles are split into paragraphs on the `<p>` marker; each paragraph
//! long enough to keep is prefixed with separator-delimited noun chunks
//! obtained from an external analyzer, then encoded with explicit start/end
//! tokens. The analyzer itself is a black box behind [`NounChunkAnalyzer`];
//! the stock implementation drives a long-lived child process speaking
//! line-delimited JSON.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};

use vocab::Vocabulary;

use crate::errors::{DatasetError, Result};
use crate::pipeline::SequenceSource;

/// Extracts noun-chunk spans from a paragraph. Failure is fatal for the
/// paragraph being processed, never silently skipped.
pub trait NounChunkAnalyzer: Send {
    fn noun_chunks(&mut self, paragraph: &str) -> Result<Vec<String>>;
}

/// Subprocess-backed analyzer: writes each paragraph as a JSON string line
/// to the child's stdin and expects a JSON array of chunk strings per line.
pub struct AnalyzerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl AnalyzerProcess {
    pub fn spawn(program: &str, args: &[String]) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|err| {
                DatasetError::Analyzer(format!("failed to spawn analyzer '{}': {}", program, err))
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DatasetError::Analyzer("failed to open analyzer stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DatasetError::Analyzer("failed to open analyzer stdout".into()))?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    fn cleanup(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl NounChunkAnalyzer for AnalyzerProcess {
    fn noun_chunks(&mut self, paragraph: &str) -> Result<Vec<String>> {
        let request = serde_json::to_string(paragraph)
            .map_err(|err| DatasetError::Analyzer(format!("failed to encode request: {err}")))?;
        self.stdin
            .write_all(request.as_bytes())
            .and_then(|_| self.stdin.write_all(b"\n"))
            .and_then(|_| self.stdin.flush())
            .map_err(|err| DatasetError::Analyzer(format!("failed to write to analyzer: {err}")))?;

        let mut line = String::new();
        let read = self
            .stdout
            .read_line(&mut line)
            .map_err(|err| DatasetError::Analyzer(format!("failed to read analyzer reply: {err}")))?;
        if read == 0 {
            return Err(DatasetError::Analyzer(
                "analyzer process closed its output".into(),
            ));
        }
        serde_json::from_str(&line)
            .map_err(|err| DatasetError::Analyzer(format!("malformed analyzer reply: {err}")))
    }
}

impl Drop for AnalyzerProcess {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[derive(Debug, Clone)]
pub struct PrefixConfig {
    pub separator: String,
    /// Paragraphs at or below this many characters are dropped.
    pub min_paragraph_chars: usize,
    /// Chunks at or above this many characters are not used as prefixes.
    pub max_chunk_chars: usize,
}

impl Default for PrefixConfig {
    fn default() -> Self {
        Self {
            separator: "~".to_string(),
            min_paragraph_chars: 50,
            max_chunk_chars: 50,
        }
    }
}

/// Sequence source producing one prefixed encoding per kept paragraph of a
/// line-delimited article file.
pub struct PrefixedSource<A: NounChunkAnalyzer> {
    path: PathBuf,
    vocab: Arc<Vocabulary>,
    analyzer: Arc<Mutex<A>>,
    config: PrefixConfig,
}

impl<A: NounChunkAnalyzer> PrefixedSource<A> {
    pub fn new(
        path: impl Into<PathBuf>,
        vocab: Arc<Vocabulary>,
        analyzer: A,
        config: PrefixConfig,
    ) -> Self {
        Self {
            path: path.into(),
            vocab,
            analyzer: Arc::new(Mutex::new(analyzer)),
            config,
        }
    }
}

impl<A: NounChunkAnalyzer> SequenceSource for PrefixedSource<A> {
    type Stream = PrefixedStream<A>;

    fn stream(&self) -> Result<Self::Stream> {
        let file = File::open(&self.path)?;
        Ok(PrefixedStream {
            lines: BufReader::new(file).lines(),
            vocab: Arc::clone(&self.vocab),
            analyzer: Arc::clone(&self.analyzer),
            config: self.config.clone(),
            pending: VecDeque::new(),
        })
    }
}

pub struct PrefixedStream<A: NounChunkAnalyzer> {
    lines: io::Lines<BufReader<File>>,
    vocab: Arc<Vocabulary>,
    analyzer: Arc<Mutex<A>>,
    config: PrefixConfig,
    pending: VecDeque<Vec<i64>>,
}

impl<A: NounChunkAnalyzer> PrefixedStream<A> {
    fn encode_article(&mut self, article: &str) -> Result<()> {
        let mut analyzer = self
            .analyzer
            .lock()
            .map_err(|_| DatasetError::Analyzer("analyzer mutex poisoned".into()))?;
        for paragraph in article.split("<p>") {
            let paragraph = paragraph.trim();
            if paragraph.chars().count() <= self.config.min_paragraph_chars {
                continue;
            }
            let ids = encode_with_chunk_prefix(
                &self.vocab,
                &mut *analyzer,
                &self.config,
                paragraph,
            )?;
            self.pending.push_back(ids);
        }
        Ok(())
    }
}

impl<A: NounChunkAnalyzer> Iterator for PrefixedStream<A> {
    type Item = Result<Vec<i64>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(ids) = self.pending.pop_front() {
                return Some(Ok(ids));
            }
            let article = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => return Some(Err(err.into())),
            };
            if let Err(err) = self.encode_article(&article) {
                return Some(Err(err));
            }
        }
    }
}

/// Builds `SEP chunk .. SEP chunk <s> paragraph </s>` for one paragraph.
pub fn encode_with_chunk_prefix(
    vocab: &Vocabulary,
    analyzer: &mut dyn NounChunkAnalyzer,
    config: &PrefixConfig,
    paragraph: &str,
) -> Result<Vec<i64>> {
    let separator = vocab.encode(&config.separator, false, false);
    let mut ids = Vec::new();
    for chunk in analyzer.noun_chunks(paragraph)? {
        if chunk.chars().count() < config.max_chunk_chars {
            ids.extend_from_slice(&separator);
            ids.extend(vocab.encode(&chunk, false, false));
        }
    }
    ids.extend(vocab.encode(paragraph, true, true));
    Ok(ids)
}
