//! Token alignment between a source and a destination prompt
//!
//! Connections pin explicit source spans to destination spans. Every
//! position not claimed by a connection is "free"; free positions are
//! paired index for index in ascending order, so both prompts must have
//! the same number of them.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::PatchError;
use crate::schema::Connection;

/// Result of aligning two tokenized prompts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alignment {
    /// Unclaimed source positions, ascending
    pub source_free: Vec<usize>,
    /// Unclaimed destination positions, ascending
    pub dest_free: Vec<usize>,
    /// `dest_free[i] -> source_free[i]`
    pub dest_to_source: BTreeMap<usize, usize>,
}

impl Alignment {
    /// Pairs of `(dest, source)` positions in destination order
    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.dest_to_source.iter().map(|(&d, &s)| (d, s))
    }
}

/// Align free positions of two prompts of `source_len` and `dest_len` tokens
///
/// Fails with [`PatchError::Validation`] when a connection points outside
/// its prompt, has an empty span, claims a destination position already
/// claimed by another connection, or when the free counts differ.
pub fn align(
    source_len: usize,
    dest_len: usize,
    connections: &[Connection],
) -> Result<Alignment, PatchError> {
    let mut source_claimed = BTreeSet::new();
    let mut dest_claimed = BTreeSet::new();

    for (k, conn) in connections.iter().enumerate() {
        if conn.start.token_indices.is_empty() || conn.end.token_indices.is_empty() {
            return Err(PatchError::validation(format!(
                "connection {k} has an empty token span"
            )));
        }
        if let Some(&i) = conn.start.token_indices.iter().find(|&&i| i >= source_len) {
            return Err(PatchError::validation(format!(
                "connection {k} starts at token {i} but the source has {source_len} tokens"
            )));
        }
        if let Some(&i) = conn.end.token_indices.iter().find(|&&i| i >= dest_len) {
            return Err(PatchError::validation(format!(
                "connection {k} ends at token {i} but the destination has {dest_len} tokens"
            )));
        }

        source_claimed.extend(conn.start.token_indices.iter().copied());

        // Each connection owns its own span; indices repeated inside one
        // span are fine, sharing with another connection is not.
        let span: BTreeSet<usize> = conn.end.token_indices.iter().copied().collect();
        if let Some(&i) = span.iter().find(|i| dest_claimed.contains(*i)) {
            return Err(PatchError::validation(format!(
                "destination token {i} is claimed by more than one connection"
            )));
        }
        dest_claimed.extend(span);
    }

    let source_free: Vec<usize> = (0..source_len)
        .filter(|i| !source_claimed.contains(i))
        .collect();
    let dest_free: Vec<usize> = (0..dest_len).filter(|i| !dest_claimed.contains(i)).collect();

    if source_free.len() != dest_free.len() {
        return Err(PatchError::validation(format!(
            "source has {} free tokens but destination has {}; prompts must differ only in token identity outside connections",
            source_free.len(),
            dest_free.len()
        )));
    }

    let dest_to_source = dest_free
        .iter()
        .copied()
        .zip(source_free.iter().copied())
        .collect();

    Ok(Alignment {
        source_free,
        dest_free,
        dest_to_source,
    })
}

/// One display column of a token-synchronised grid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLabel {
    pub text: String,
    /// Destination position whose results fill this column
    pub index: usize,
    /// Connection that produced the column, if any
    pub connection: Option<usize>,
}

/// Column labels in destination order
///
/// A connection's destination span collapses into one label made of its
/// decoded tokens, represented by the last index the span lists. Every other
/// position gets its own label.
pub fn column_labels(connections: &[Connection], dest_tokens: &[String]) -> Vec<ColumnLabel> {
    let mut owner: BTreeMap<usize, usize> = BTreeMap::new();
    for (k, conn) in connections.iter().enumerate() {
        for &i in &conn.end.token_indices {
            owner.entry(i).or_insert(k);
        }
    }

    let mut labels = Vec::with_capacity(dest_tokens.len());
    let mut emitted = BTreeSet::new();
    for (pos, token) in dest_tokens.iter().enumerate() {
        match owner.get(&pos) {
            Some(&k) => {
                if !emitted.insert(k) {
                    continue;
                }
                let span: BTreeSet<usize> = connections[k]
                    .end
                    .token_indices
                    .iter()
                    .copied()
                    .filter(|&i| i < dest_tokens.len())
                    .collect();
                let text: String = span.iter().map(|&i| dest_tokens[i].as_str()).collect();
                let index = connections[k]
                    .end
                    .last()
                    .filter(|&i| i < dest_tokens.len())
                    .unwrap_or(pos);
                labels.push(ColumnLabel {
                    text,
                    index,
                    connection: Some(k),
                });
            }
            None => labels.push(ColumnLabel {
                text: token.clone(),
                index: pos,
                connection: None,
            }),
        }
    }
    labels
}
