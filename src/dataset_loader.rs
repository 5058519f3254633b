//! 帖子数据集（posts JSON）
//!
//! ```json
//! {
//!   "posts": [{ "path": "images/1.jpg", "subreddit": 3, "title": "My cat on the sofa" }],
//!   "subreddit_indices_map": { "aww": 3 }
//! }
//! ```
//!
//! `subreddit` 就是类别下标；`subreddit_indices_map` 可选，用于把下标还原成名字。

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub path: PathBuf,
    pub subreddit: usize,
    pub title: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PostsFile {
    pub posts: Vec<Post>,
    #[serde(default)]
    pub subreddit_indices_map: HashMap<String, usize>,
}

impl PostsFile {
    /// 读取帖子文件；`limit` 只保留前 N 条
    pub fn load<P: AsRef<Path>>(path: P, limit: Option<usize>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)?;
        let mut file: PostsFile = serde_json::from_str(&data)?;
        if let Some(limit) = limit {
            file.posts.truncate(limit);
        }
        log::info!("从 {:?} 读取了 {} 条帖子", path, file.posts.len());
        Ok(file)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// 类别下标 → 名字
    pub fn category_names(&self) -> HashMap<usize, String> {
        self.subreddit_indices_map
            .iter()
            .map(|(name, &index)| (index, name.clone()))
            .collect()
    }

    pub fn category_name(&self, index: usize) -> Option<&str> {
        self.subreddit_indices_map
            .iter()
            .find(|&(_, &i)| i == index)
            .map(|(name, _)| name.as_str())
    }

    pub fn titles(&self) -> Vec<&str> {
        self.posts.iter().map(|post| post.title.as_str()).collect()
    }
}
