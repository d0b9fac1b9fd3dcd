//! Lookup of per-recipient attachments in a folder.
//!
//! The folder is listed once per run. A recipient's file is then found by
//! its rendered name, by the same name in any letter case, or by matching
//! the words of the recipient's name against the words of each file name.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use herald_common::internal;
use tracing::warn;

use crate::campaign::Variables;

/// Columns tried, case-insensitively, when no name column is configured
const NAME_COLUMNS: &[&str] = &["name", "full_name", "nombre", "nombres", "nombre_completo"];

/// Words a file name may carry on top of the recipient's name
const FILLER_WORDS: &[&str] = &["invitacion", "invitation", "inv"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedFile {
    pub filename: String,
    pub path: PathBuf,
    lowercase: String,
    words: HashSet<String>,
}

impl IndexedFile {
    fn new(filename: String, path: PathBuf) -> Self {
        let stem = filename
            .rsplit_once('.')
            .map_or(filename.as_str(), |(stem, _)| stem);

        Self {
            lowercase: filename.to_lowercase(),
            words: words(stem),
            filename,
            path,
        }
    }
}

/// Files of one attachment folder, sorted by name
#[derive(Debug, Clone, Default)]
pub struct AttachmentIndex {
    files: Vec<IndexedFile>,
}

impl AttachmentIndex {
    /// List the regular files of `folder`.
    ///
    /// An unreadable folder yields an empty index; every lookup then misses
    /// and the worker reports the missing attachment per recipient.
    pub async fn build(folder: &Path) -> Self {
        match Self::scan(folder).await {
            Ok(index) => {
                internal!(
                    level = DEBUG,
                    "Indexed {} attachment(s) in {}",
                    index.files.len(),
                    folder.display()
                );
                index
            }
            Err(e) => {
                warn!("Cannot list attachment folder {}: {e}", folder.display());
                Self::default()
            }
        }
    }

    async fn scan(folder: &Path) -> std::io::Result<Self> {
        let mut entries = tokio::fs::read_dir(folder).await?;
        let mut files = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let filename = entry.file_name().to_string_lossy().into_owned();
            if filename.starts_with('.') {
                continue;
            }
            files.push(IndexedFile::new(filename, entry.path()));
        }

        files.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(Self { files })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// The file called `filename`, ignoring letter case
    #[must_use]
    pub fn find_ignoring_case(&self, filename: &str) -> Option<&IndexedFile> {
        let wanted = filename.to_lowercase();
        self.files.iter().find(|file| file.lowercase == wanted)
    }

    /// Best file for a person's `name`, tried in this order:
    /// 1. every word of the name appears in the file name
    /// 2. every word of the file name (fillers aside) appears in the name
    /// 3. at least 80% of the name's words appear in the file name
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<&IndexedFile> {
        let name = words(name);
        if name.is_empty() {
            return None;
        }

        if let Some(file) = self.files.iter().find(|file| name.is_subset(&file.words)) {
            return Some(file);
        }

        let reverse = self.files.iter().find(|file| {
            let mut significant = file
                .words
                .iter()
                .filter(|word| !FILLER_WORDS.contains(&word.as_str()))
                .peekable();
            significant.peek().is_some() && significant.all(|word| name.contains(word))
        });
        if reverse.is_some() {
            return reverse;
        }

        self.files.iter().find(|file| {
            let shared = name.intersection(&file.words).count();
            shared * 5 >= name.len() * 4
        })
    }
}

/// The recipient's name: `column` when given, otherwise the first of the
/// usual name columns present. Blank values count as absent.
#[must_use]
pub fn recipient_name<'a>(variables: &'a Variables, column: Option<&str>) -> Option<&'a str> {
    let value = match column {
        Some(column) => variables.get(column),
        None => variables
            .iter()
            .find(|(key, value)| {
                NAME_COLUMNS.contains(&key.to_lowercase().as_str()) && !value.trim().is_empty()
            })
            .map(|(_, value)| value),
    };

    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Lowercase words with accents folded and punctuation removed
#[must_use]
pub fn normalize(text: &str) -> String {
    text.chars()
        .flat_map(char::to_lowercase)
        .map(fold_accent)
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '_')
        .collect()
}

fn words(text: &str) -> HashSet<String> {
    normalize(text)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Latin letters with diacritics mapped to their base letter
const fn fold_accent(c: char) -> char {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => 'a',
        'ç' | 'ć' | 'ĉ' | 'ċ' | 'č' => 'c',
        'ď' | 'đ' => 'd',
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ĕ' | 'ė' | 'ę' | 'ě' => 'e',
        'ĝ' | 'ğ' | 'ġ' | 'ģ' => 'g',
        'ĥ' | 'ħ' => 'h',
        'ì' | 'í' | 'î' | 'ï' | 'ĩ' | 'ī' | 'ĭ' | 'į' | 'ı' => 'i',
        'ĵ' => 'j',
        'ķ' => 'k',
        'ĺ' | 'ļ' | 'ľ' | 'ŀ' | 'ł' => 'l',
        'ñ' | 'ń' | 'ņ' | 'ň' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ŏ' | 'ő' => 'o',
        'ŕ' | 'ŗ' | 'ř' => 'r',
        'ś' | 'ŝ' | 'ş' | 'š' => 's',
        'ţ' | 'ť' | 'ŧ' => 't',
        'ù' | 'ú' | 'û' | 'ü' | 'ũ' | 'ū' | 'ŭ' | 'ů' | 'ű' | 'ų' => 'u',
        'ŵ' => 'w',
        'ý' | 'ÿ' | 'ŷ' => 'y',
        'ź' | 'ż' | 'ž' => 'z',
        other => other,
    }
}
