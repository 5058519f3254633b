//! # 贪心解码状态机
//!
//! ```text
//!            encode + seed                argmax ≠ END, 未满 max_len
//! SEEDING ──────────────────▶ STEPPING ◀──────────────────────────┐
//!                                │ └──────────────────────────────┘
//!                                │ argmax = END      → DONE(EndToken)
//!                                │ 已生成 max_len 个词 → DONE(MaxLength)
//!                                ▼
//!                               DONE
//! ```
//!
//! 每次 [`TitleDecoder::advance`] 只做一次状态转移，调用方可以逐步驱动、随时停下；
//! [`TitleDecoder::run`] 一直驱动到 DONE。END 永远不会出现在输出里，
//! 而 `max_len` 保证即使模型退化也一定会停下。

use ndarray::{Array1, ArrayView3};

use crate::{
    embeddings::EmbeddingMatrix,
    error::Result,
    inference::{InferenceDecoderGraph, InferenceEncoderGraph},
    utils::argmax,
    vocab::Vocab,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// 模型输出了 END
    EndToken,
    /// 达到 `max_len`，标题被截断
    MaxLength,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DecodeState {
    Seeding,
    Stepping {
        prev_embedding: Array1<f32>,
        h: Array1<f32>,
        c: Array1<f32>,
    },
    Done(StopReason),
}

/// 一次生成的完整结果
#[derive(Clone, Debug, PartialEq)]
pub struct Generation {
    pub token_ids: Vec<usize>,
    pub words: Vec<String>,
    pub stop_reason: StopReason,
}

impl Generation {
    pub fn text(&self) -> String {
        self.words.join(" ")
    }
}

pub struct TitleDecoder<'a> {
    encoder: &'a InferenceEncoderGraph,
    decoder: &'a InferenceDecoderGraph,
    embeddings: &'a EmbeddingMatrix,
    vocab: &'a Vocab,
    image: ArrayView3<'a, f32>,
    category: Array1<f32>,
    max_len: usize,
    state: DecodeState,
    token_ids: Vec<usize>,
}

impl<'a> TitleDecoder<'a> {
    /// 输入应当已经校验过；见 [`crate::CaptionModel::decoder`]
    pub fn new(
        encoder: &'a InferenceEncoderGraph,
        decoder: &'a InferenceDecoderGraph,
        embeddings: &'a EmbeddingMatrix,
        vocab: &'a Vocab,
        image: ArrayView3<'a, f32>,
        category: Array1<f32>,
        max_len: usize,
    ) -> Self {
        Self {
            encoder,
            decoder,
            embeddings,
            vocab,
            image,
            category,
            max_len,
            state: DecodeState::Seeding,
            token_ids: Vec::with_capacity(max_len),
        }
    }

    pub fn state(&self) -> &DecodeState {
        &self.state
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, DecodeState::Done(_))
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.state {
            DecodeState::Done(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn token_ids(&self) -> &[usize] {
        &self.token_ids
    }

    /// **一次状态转移**
    ///
    /// 产生新词时返回 `Some(id)`；SEEDING、输出 END 以及已经 DONE 时返回 `None`。
    pub fn advance(&mut self) -> Result<Option<usize>> {
        match &self.state {
            DecodeState::Done(_) => Ok(None),
            DecodeState::Seeding => {
                let encoded = self.encoder.encode(self.image, self.category.view())?;
                let (h, c) = self.decoder.seed(&encoded);
                let prev_embedding = self.embeddings.lookup(self.vocab.start_id())?.to_owned();

                self.state = if self.max_len == 0 {
                    DecodeState::Done(StopReason::MaxLength)
                } else {
                    DecodeState::Stepping {
                        prev_embedding,
                        h,
                        c,
                    }
                };
                Ok(None)
            }
            DecodeState::Stepping {
                prev_embedding,
                h,
                c,
            } => {
                let output = self.decoder.step(prev_embedding, h, c);
                let id = argmax(output.probs.view());
                log::debug!("解码第 {} 步: id={}", self.token_ids.len() + 1, id);

                if id == self.vocab.end_id() {
                    self.state = DecodeState::Done(StopReason::EndToken);
                    return Ok(None);
                }

                let next_embedding = self.embeddings.lookup(id)?.to_owned();
                self.token_ids.push(id);
                self.state = if self.token_ids.len() >= self.max_len {
                    DecodeState::Done(StopReason::MaxLength)
                } else {
                    DecodeState::Stepping {
                        prev_embedding: next_embedding,
                        h: output.h,
                        c: output.c,
                    }
                };
                Ok(Some(id))
            }
        }
    }

    /// 驱动到 DONE
    pub fn run(mut self) -> Result<Generation> {
        while !self.is_done() {
            self.advance()?;
        }

        let stop_reason = self.stop_reason().unwrap_or(StopReason::MaxLength);
        let words = self
            .token_ids
            .iter()
            .filter_map(|&id| self.vocab.word_of(id))
            .map(str::to_string)
            .collect();

        Ok(Generation {
            token_ids: self.token_ids,
            words,
            stop_reason,
        })
    }
}
