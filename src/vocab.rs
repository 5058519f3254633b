use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TitlingError};

/// 除空格以外也当作分隔符的字符
static FILTERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r##"[!"#$%&()*+,\-./:;<=>?@\[\\\]^_`{|}~\t\n]"##)
        .expect("separator pattern is a valid regex")
});

/// 每个词表都带有的四个保留词
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecialToken {
    Start,
    Pad,
    Unknown,
    End,
}

impl SpecialToken {
    /// 默认编号：START=0, PAD=1, UNK=2, END=3
    pub const ALL: [SpecialToken; 4] = [
        SpecialToken::Start,
        SpecialToken::Pad,
        SpecialToken::Unknown,
        SpecialToken::End,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SpecialToken::Start => "<START>",
            SpecialToken::Pad => "<PAD>",
            SpecialToken::Unknown => "<UNK>",
            SpecialToken::End => "<END>",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct SpecialIds {
    start: usize,
    pad: usize,
    unknown: usize,
    end: usize,
}

/// 词 ↔ id 双向映射，id 连续分布在 `[0, len)`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vocab {
    encode: HashMap<String, usize>,
    words: Vec<String>,
    special: SpecialIds,
}

impl Default for Vocab {
    fn default() -> Self {
        Self::new(Vec::<&str>::new())
    }
}

impl Vocab {
    /// 保留词占 0..4，其后按顺序放入 `words`；重复词和与保留词同名的词被跳过
    pub fn new<S: AsRef<str>>(words: impl IntoIterator<Item = S>) -> Self {
        let mut encode = HashMap::new();
        let mut all_words = Vec::new();

        for token in SpecialToken::ALL {
            encode.insert(token.as_str().to_string(), all_words.len());
            all_words.push(token.as_str().to_string());
        }

        for word in words {
            let word = word.as_ref();
            if word.is_empty() || encode.contains_key(word) {
                continue;
            }
            encode.insert(word.to_string(), all_words.len());
            all_words.push(word.to_string());
        }

        Vocab {
            encode,
            words: all_words,
            special: SpecialIds {
                start: 0,
                pad: 1,
                unknown: 2,
                end: 3,
            },
        }
    }

    /// 采用外部构建的映射。id 必须连续，四个保留词必须以标准写法出现
    pub fn from_mapping(mapping: HashMap<String, usize>) -> Result<Self> {
        let mut words = vec![None; mapping.len()];
        for (word, &id) in &mapping {
            match words.get_mut(id) {
                Some(slot @ None) => *slot = Some(word.clone()),
                Some(Some(other)) => {
                    return Err(TitlingError::InvalidVocabulary(format!(
                        "id {id} is assigned to both `{other}` and `{word}`"
                    )));
                }
                None => {
                    return Err(TitlingError::InvalidVocabulary(format!(
                        "id {id} of `{word}` is outside [0, {})",
                        mapping.len()
                    )));
                }
            }
        }
        let words: Vec<String> = words.into_iter().flatten().collect();

        let lookup = |token: SpecialToken| {
            mapping.get(token.as_str()).copied().ok_or_else(|| {
                TitlingError::InvalidVocabulary(format!(
                    "reserved token {} is missing",
                    token.as_str()
                ))
            })
        };
        let special = SpecialIds {
            start: lookup(SpecialToken::Start)?,
            pad: lookup(SpecialToken::Pad)?,
            unknown: lookup(SpecialToken::Unknown)?,
            end: lookup(SpecialToken::End)?,
        };

        Ok(Vocab {
            encode: mapping,
            words,
            special,
        })
    }

    /// 收集 `texts` 中所有不同的词（排序后）构建词表
    pub fn build_from_texts<S: AsRef<str>>(texts: &[S]) -> Self {
        let words: BTreeSet<String> = texts
            .iter()
            .flat_map(|text| Self::tokenize(text.as_ref()))
            .collect();
        Self::new(words)
    }

    /// 转小写，按空白和标点切分
    pub fn tokenize(text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        FILTERS
            .replace_all(&lowered, " ")
            .split(' ')
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Convert a word to its token index, `<UNK>` when absent
    pub fn id_of(&self, word: &str) -> usize {
        self.encode
            .get(word)
            .copied()
            .unwrap_or(self.special.unknown)
    }

    /// Convert a word to its token index without the unknown fallback
    pub fn encode(&self, word: &str) -> Option<usize> {
        self.encode.get(word).copied()
    }

    /// Convert a token index back to a word
    pub fn word_of(&self, id: usize) -> Option<&str> {
        self.words.get(id).map(String::as_str)
    }

    pub fn special_id(&self, token: SpecialToken) -> usize {
        match token {
            SpecialToken::Start => self.special.start,
            SpecialToken::Pad => self.special.pad,
            SpecialToken::Unknown => self.special.unknown,
            SpecialToken::End => self.special.end,
        }
    }

    pub fn start_id(&self) -> usize {
        self.special.start
    }

    pub fn end_id(&self) -> usize {
        self.special.end
    }

    pub fn pad_id(&self) -> usize {
        self.special.pad
    }

    pub fn unknown_id(&self) -> usize {
        self.special.unknown
    }

    pub fn is_special(&self, id: usize) -> bool {
        SpecialToken::ALL
            .iter()
            .any(|&token| self.special_id(token) == id)
    }

    /// 分词并把每个词映射为 id
    pub fn encode_sequence(&self, text: &str) -> Vec<usize> {
        Self::tokenize(text)
            .iter()
            .map(|word| self.id_of(word))
            .collect()
    }

    /// 用单个空格连接 `ids` 对应的词，跳过词表外的 id
    pub fn decode_sequence(&self, ids: &[usize]) -> String {
        ids.iter()
            .filter_map(|&id| self.word_of(id))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }
}
