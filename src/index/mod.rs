//! 模糊搜索索引
//!
//! 每个被索引的文件对应一条 IndexEntry：文件名、内容指纹、
//! 内容摘录缓存。查询同时打分文件名和摘录行，按组合代价排序。
//!
//! 指纹等于上次索引时内容的哈希。保存路径直接把写盘的内容喂进来，
//! 指纹未变时跳过重建摘录，这让重复索引天然幂等。
//! 磁盘上可能已经变化但尚未重新索引的条目带陈旧标记返回，
//! 不会被悄悄当成新鲜结果。

pub mod rebuild;
pub mod score;

use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;

use crate::fs;
use score::{combine, subsequence_match};

/// 查询结果的默认条数上限
pub const DEFAULT_RESULT_LIMIT: usize = 15;

/// 一次模糊查询
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub text: String,
    pub limit: usize,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            limit: DEFAULT_RESULT_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// 命中的内容行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineHit {
    /// 1 起始的行号
    pub line_no: usize,
    /// 摘录缓存中的行文本（已裁剪）
    pub text: String,
    /// span 指向 `text` 内的字节区间
    pub span: (usize, usize),
}

/// 单条查询结果，score 越小排名越高
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub path: PathBuf,
    pub score: usize,
    /// 文件名命中的字节区间
    pub filename_span: Option<(usize, usize)>,
    /// 内容命中时给出最佳行
    pub line_hit: Option<LineHit>,
    /// 条目落后于磁盘内容时为 true
    pub stale: bool,
}

#[derive(Debug, Clone)]
struct ExcerptLine {
    line_no: usize,
    text: String,
}

/// 单个文件的索引记录
#[derive(Debug, Clone)]
pub struct IndexEntry {
    name: String,
    fingerprint: u64,
    excerpt: Vec<ExcerptLine>,
    stale: bool,
}

impl IndexEntry {
    /// 从内存内容构建条目
    pub fn build(path: &Path, content: &str, max_lines: usize, max_line_len: usize) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name,
            fingerprint: fs::fingerprint(content),
            excerpt: build_excerpt(content, max_lines, max_line_len),
            stale: false,
        }
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

fn build_excerpt(content: &str, max_lines: usize, max_line_len: usize) -> Vec<ExcerptLine> {
    let mut lines = Vec::new();
    for (i, raw) in content.lines().enumerate() {
        if lines.len() >= max_lines {
            break;
        }
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        lines.push(ExcerptLine {
            line_no: i + 1,
            text: truncate_chars(trimmed, max_line_len),
        });
    }
    lines
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

pub type EntryMap = FxHashMap<PathBuf, IndexEntry>;

/// 文件名 + 内容的内存索引
pub struct FuzzyIndex {
    entries: EntryMap,
    max_excerpt_lines: usize,
    max_excerpt_len: usize,
}

impl FuzzyIndex {
    pub fn new(max_excerpt_lines: usize, max_excerpt_len: usize) -> Self {
        Self {
            entries: EntryMap::default(),
            max_excerpt_lines,
            max_excerpt_len,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn fingerprint_of(&self, path: &Path) -> Option<u64> {
        self.entries.get(path).map(|e| e.fingerprint)
    }

    pub fn is_stale(&self, path: &Path) -> bool {
        self.entries.get(path).map(|e| e.stale).unwrap_or(false)
    }

    /// 以给定内容重建条目，返回是否真的发生了重建
    ///
    /// 指纹一致时不重建摘录，只把条目恢复为新鲜状态。
    pub fn update_file(&mut self, path: &Path, content: &str) -> bool {
        let fingerprint = fs::fingerprint(content);
        if let Some(entry) = self.entries.get_mut(path) {
            if entry.fingerprint == fingerprint {
                entry.stale = false;
                return false;
            }
        }
        let entry = IndexEntry::build(path, content, self.max_excerpt_lines, self.max_excerpt_len);
        self.entries.insert(path.to_path_buf(), entry);
        true
    }

    pub fn remove_file(&mut self, path: &Path) -> bool {
        self.entries.remove(path).is_some()
    }

    /// 条目随改名迁移到新路径，指纹、摘录和陈旧标记原样保留
    pub fn rename_file(&mut self, from: &Path, to: &Path) -> bool {
        let Some(mut entry) = self.entries.remove(from) else {
            return false;
        };
        entry.name = to
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.entries.insert(to.to_path_buf(), entry);
        true
    }

    /// 标记条目可能落后于磁盘，结果里继续出现但带陈旧标记
    pub fn mark_stale(&mut self, path: &Path) {
        if let Some(entry) = self.entries.get_mut(path) {
            entry.stale = true;
        }
    }

    /// 整体换入一批新条目，旧索引原子性丢弃
    pub fn replace_all(&mut self, entries: EntryMap) {
        self.entries = entries;
    }

    /// 执行查询，返回按代价升序的结果
    ///
    /// 并列时短路径在前，再并列按路径字典序。空查询返回空结果，
    /// 不做全量罗列。
    pub fn search(&self, query: &SearchQuery) -> Vec<SearchResult> {
        let text = query.text.trim().to_ascii_lowercase();
        if text.is_empty() {
            return Vec::new();
        }

        let mut results = Vec::new();
        for (path, entry) in &self.entries {
            let filename = subsequence_match(&text, &entry.name);

            let mut best_line: Option<(usize, &ExcerptLine, (usize, usize))> = None;
            for line in &entry.excerpt {
                if let Some(m) = subsequence_match(&text, &line.text) {
                    let better = match &best_line {
                        Some((best_cost, _, _)) => m.cost < *best_cost,
                        None => true,
                    };
                    if better {
                        best_line = Some((m.cost, line, m.span));
                    }
                }
            }

            let Some(score) = combine(
                filename.as_ref().map(|m| m.cost),
                best_line.as_ref().map(|(cost, _, _)| *cost),
            ) else {
                continue;
            };

            results.push(SearchResult {
                path: path.clone(),
                score,
                filename_span: filename.map(|m| m.span),
                line_hit: best_line.map(|(_, line, span)| LineHit {
                    line_no: line.line_no,
                    text: line.text.clone(),
                    span,
                }),
                stale: entry.stale,
            });
        }

        results.sort_unstable_by(|a, b| {
            a.score
                .cmp(&b.score)
                .then_with(|| a.path.as_os_str().len().cmp(&b.path.as_os_str().len()))
                .then_with(|| a.path.cmp(&b.path))
        });
        results.truncate(query.limit);
        results
    }
}

#[cfg(test)]
#[path = "../../tests/unit/index.rs"]
mod tests;
