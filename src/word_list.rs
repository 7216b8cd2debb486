//! `to_word_list_format`: stop-word / bad-word list pre-encoding
//!
//! Bit-exact port of `original_source`'s `to_word_list_format` (§4.7, §9):
//! row 0 of the `[B, 2, P]` result is the flattened, concatenated token ids
//! for each batch element's words, right-padded with `0`; row 1 is the
//! cumulative per-word offset into row 0, right-padded with `-1`. This
//! padding scheme is consumed bit-for-bit by the external sampling kernel
//! and must not be altered.

/// `[B, 2, P]` flattened as `Vec<Vec<[ids_row, offsets_row]>>`-equivalent:
/// one `WordListEncoding` per batch element, each holding the two
/// equal-length rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordListEncoding {
    pub ids: Vec<i32>,
    pub offsets: Vec<i32>,
}

/// Encode `words_per_batch[b]` (a list of word strings for batch element
/// `b`) using `encode` (the external tokenizer), right-padding every row to
/// the longest flattened length `P` across the batch with `0` for ids and
/// `-1` for offsets.
pub fn to_word_list_format(
    words_per_batch: &[Vec<String>],
    mut encode: impl FnMut(&str) -> Vec<i32>,
) -> Vec<WordListEncoding> {
    let mut per_batch: Vec<(Vec<i32>, Vec<i32>)> = Vec::with_capacity(words_per_batch.len());
    let mut max_len = 0usize;

    for words in words_per_batch {
        let mut flat_ids = Vec::new();
        let mut offsets = Vec::new();
        let mut cumulative = 0i32;

        for word in words {
            let ids = encode(word);
            if ids.is_empty() {
                continue;
            }
            flat_ids.extend(ids.iter().copied());
            cumulative += ids.len() as i32;
            offsets.push(cumulative);
        }

        max_len = max_len.max(flat_ids.len());
        per_batch.push((flat_ids, offsets));
    }

    per_batch
        .into_iter()
        .map(|(mut ids, mut offsets)| {
            ids.resize(max_len, 0);
            offsets.resize(max_len, -1);
            WordListEncoding { ids, offsets }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_encode(word: &str) -> Vec<i32> {
        word.split_whitespace().map(|tok| tok.len() as i32).collect()
    }

    #[test]
    fn encodes_and_pads_rows_to_longest_flattened_length() {
        let batches = vec![vec![" I am happy".to_string(), " I am sad".to_string()]];
        let encoded = to_word_list_format(&batches, fake_encode);

        assert_eq!(encoded.len(), 1);
        let row = &encoded[0];
        // " I am happy" -> ["I","am","happy"] -> lens [1,2,5]; " I am sad" -> [1,2,3]
        assert_eq!(row.ids, vec![1, 2, 5, 1, 2, 3]);
        assert_eq!(row.offsets, vec![3, 6, -1, -1, -1, -1]);
        assert_eq!(row.ids.len(), row.offsets.len());
    }

    #[test]
    fn shorter_batch_rows_pad_with_zero_and_minus_one() {
        let batches = vec![
            vec!["aa bb".to_string()],
            vec!["a".to_string()],
        ];
        let encoded = to_word_list_format(&batches, fake_encode);

        assert_eq!(encoded[1].ids, vec![1, 0]);
        assert_eq!(encoded[1].offsets, vec![1, -1]);
    }

    #[test]
    fn empty_words_are_skipped() {
        let batches = vec![vec!["".to_string(), "ok".to_string()]];
        let encoded = to_word_list_format(&batches, fake_encode);
        assert_eq!(encoded[0].ids, vec![2]);
        assert_eq!(encoded[0].offsets, vec![1]);
    }
}
