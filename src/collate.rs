// Assembles tokenized pairs into training-ready batches, either densely
// padded or length-packed with segment markers.

use serde::{Deserialize, Serialize};

use crate::encoder::ImageFeatures;
use crate::preference::{Extra, TokenizedPair};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadSide {
    Left,
    Right,
}

/// Pad every sequence to the longest one, inserting `value` on one side.
pub fn pad_sequences(sequences: &[Vec<i32>], side: PadSide, value: i32) -> Vec<Vec<i32>> {
    let max_len = sequences.iter().map(Vec::len).max().unwrap_or(0);
    sequences
        .iter()
        .map(|sequence| {
            let mut row = Vec::with_capacity(max_len);
            match side {
                PadSide::Right => {
                    row.extend_from_slice(sequence);
                    row.resize(max_len, value);
                }
                PadSide::Left => {
                    row.resize(max_len - sequence.len(), value);
                    row.extend_from_slice(sequence);
                }
            }
            row
        })
        .collect()
}

/// A densely padded batch. Within one field all rows share a length; the
/// chosen and rejected fields are padded independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaddedBatch {
    pub chosen_ids: Vec<Vec<i32>>,
    pub chosen_masks: Vec<Vec<i32>>,
    pub reject_ids: Vec<Vec<i32>>,
    pub reject_masks: Vec<Vec<i32>>,
    pub chosen_loss_masks: Vec<Vec<i32>>,
    pub reject_loss_masks: Vec<Vec<i32>>,
    pub extras: Vec<Extra>,
    /// Image features stacked along the batch axis, multimodal only.
    pub chosen_images: Option<ImageFeatures>,
    pub reject_images: Option<ImageFeatures>,
}

fn concat_images(items: &[TokenizedPair]) -> (Option<ImageFeatures>, Option<ImageFeatures>) {
    if items.is_empty() || items.iter().any(|item| item.images.is_none()) {
        return (None, None);
    }
    let mut chosen = ImageFeatures::default();
    let mut reject = ImageFeatures::default();
    for item in items {
        let (chosen_images, reject_images) = item.images.as_ref().unwrap();
        chosen.append(chosen_images);
        reject.append(reject_images);
    }
    (Some(chosen), Some(reject))
}

/// Stack a batch of pairs into one padded tensor per field.
///
/// DPO pads right, reward classification pads left. Token id fields pad
/// with the pad token, mask fields with 0. Extras are collected as-is.
pub fn collate(items: &[TokenizedPair], is_dpo: bool, pad_token_id: i32) -> PaddedBatch {
    let side = if is_dpo { PadSide::Right } else { PadSide::Left };

    let chosen_ids: Vec<Vec<i32>> = items.iter().map(|i| i.chosen.input_ids.clone()).collect();
    let chosen_masks: Vec<Vec<i32>> = items
        .iter()
        .map(|i| i.chosen.attention_mask.clone())
        .collect();
    let reject_ids: Vec<Vec<i32>> = items.iter().map(|i| i.rejected.input_ids.clone()).collect();
    let reject_masks: Vec<Vec<i32>> = items
        .iter()
        .map(|i| i.rejected.attention_mask.clone())
        .collect();
    let chosen_loss_masks: Vec<Vec<i32>> =
        items.iter().map(|i| i.chosen.loss_mask.clone()).collect();
    let reject_loss_masks: Vec<Vec<i32>> =
        items.iter().map(|i| i.rejected.loss_mask.clone()).collect();
    let (chosen_images, reject_images) = concat_images(items);

    PaddedBatch {
        chosen_ids: pad_sequences(&chosen_ids, side, pad_token_id),
        chosen_masks: pad_sequences(&chosen_masks, side, 0),
        reject_ids: pad_sequences(&reject_ids, side, pad_token_id),
        reject_masks: pad_sequences(&reject_masks, side, 0),
        chosen_loss_masks: pad_sequences(&chosen_loss_masks, side, 0),
        reject_loss_masks: pad_sequences(&reject_loss_masks, side, 0),
        extras: items.iter().map(|i| i.extra).collect(),
        chosen_images,
        reject_images,
    }
}

/// A length-packed batch: one flat row of token ids with per-position
/// segment ids instead of a rectangular tensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackedBatch {
    pub input_ids: Vec<i32>,
    /// Segment id per position: chosen sequences are numbered `1..=N`,
    /// rejected `N+1..=2N`, alignment padding is 0.
    pub segment_ids: Vec<i32>,
    /// Per-sequence lengths, all chosen then all rejected, in batch order.
    pub packed_seq_lens: Vec<usize>,
    pub extras: Vec<Extra>,
}

/// Concatenate every chosen sequence then every rejected sequence into one
/// flat row, right-padded so the total length is a multiple of
/// `multiple_of`. Loss masks are not carried through packing.
pub fn packing_collate(
    items: &[TokenizedPair],
    multiple_of: usize,
    pad_token_id: i32,
) -> PackedBatch {
    let total: usize = items
        .iter()
        .map(|i| i.chosen.input_ids.len() + i.rejected.input_ids.len())
        .sum();
    let mut input_ids = Vec::with_capacity(total);
    let mut segment_ids = Vec::with_capacity(total);
    let mut packed_seq_lens = Vec::with_capacity(2 * items.len());
    let mut extras = Vec::with_capacity(items.len());

    for (index, item) in items.iter().enumerate() {
        input_ids.extend_from_slice(&item.chosen.input_ids);
        segment_ids.extend(std::iter::repeat(index as i32 + 1).take(item.chosen.input_ids.len()));
        packed_seq_lens.push(item.chosen.input_ids.len());
        extras.push(item.extra);
    }
    for (index, item) in items.iter().enumerate() {
        let segment = (index + items.len()) as i32 + 1;
        input_ids.extend_from_slice(&item.rejected.input_ids);
        segment_ids.extend(std::iter::repeat(segment).take(item.rejected.input_ids.len()));
        packed_seq_lens.push(item.rejected.input_ids.len());
    }

    if multiple_of > 1 && input_ids.len() % multiple_of != 0 {
        let padding_len = multiple_of - input_ids.len() % multiple_of;
        input_ids.extend(std::iter::repeat(pad_token_id).take(padding_len));
        segment_ids.extend(std::iter::repeat(0).take(padding_len));
    }

    PackedBatch {
        input_ids,
        segment_ids,
        packed_seq_lens,
        extras,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::testing::{EOS, PAD};
    use crate::preference::TokenizedSide;

    fn side(ids: Vec<i32>) -> TokenizedSide {
        let len = ids.len();
        TokenizedSide {
            input_ids: ids,
            attention_mask: vec![1; len],
            loss_mask: vec![1; len],
        }
    }

    fn pair(chosen: Vec<i32>, rejected: Vec<i32>) -> TokenizedPair {
        TokenizedPair {
            chosen: side(chosen),
            rejected: side(rejected),
            extra: Extra::Margin(0.0),
            images: None,
        }
    }

    #[test]
    fn test_pad_right_recoverable() {
        let padded = pad_sequences(&[vec![1, 2, 3], vec![4]], PadSide::Right, PAD);
        assert_eq!(padded, vec![vec![1, 2, 3], vec![4, PAD, PAD]]);
    }

    #[test]
    fn test_pad_left_recoverable() {
        let padded = pad_sequences(&[vec![1, 2, 3], vec![4]], PadSide::Left, PAD);
        assert_eq!(padded, vec![vec![1, 2, 3], vec![PAD, PAD, 4]]);
    }

    #[test]
    fn test_pad_empty_batch() {
        assert!(pad_sequences(&[], PadSide::Left, PAD).is_empty());
    }

    #[test]
    fn test_collate_sides_padded_independently() {
        let items = vec![pair(vec![1, 2, 3, EOS], vec![5, EOS]), pair(vec![6, EOS], vec![7, 8, EOS])];
        let batch = collate(&items, false, PAD);
        // reward mode pads left
        assert_eq!(batch.chosen_ids[0].len(), 4);
        assert_eq!(batch.chosen_ids[1], vec![PAD, PAD, 6, EOS]);
        assert_eq!(batch.reject_ids[0], vec![PAD, 5, EOS]);
        assert_eq!(batch.chosen_masks[1], vec![0, 0, 1, 1]);
        assert_eq!(batch.extras.len(), 2);
        assert!(batch.chosen_images.is_none());
    }

    #[test]
    fn test_collate_dpo_pads_right() {
        let items = vec![pair(vec![1, EOS], vec![5, EOS]), pair(vec![6, 7, EOS], vec![8, EOS])];
        let batch = collate(&items, true, PAD);
        assert_eq!(batch.chosen_ids[0], vec![1, EOS, PAD]);
        assert_eq!(batch.chosen_loss_masks[0], vec![1, 1, 0]);
    }

    #[test]
    fn test_collate_concatenates_images() {
        let features = ImageFeatures {
            pixel_values: vec![0.5; 4],
            feature_width: 4,
            image_grid: vec![[1, 2, 2]],
        };
        let mut items = vec![pair(vec![1, EOS], vec![2, EOS]), pair(vec![3, EOS], vec![4, EOS])];
        for item in &mut items {
            item.images = Some((features.clone(), features.clone()));
        }
        let batch = collate(&items, false, PAD);
        let chosen_images = batch.chosen_images.unwrap();
        assert_eq!(chosen_images.num_rows(), 2);
        assert_eq!(batch.reject_images.unwrap().image_grid.len(), 2);
    }

    #[test]
    fn test_packing_collate_alignment() {
        // 2 chosen + 2 rejected of lengths [3, 5, 4, 2], multiple_of=8
        let items = vec![
            pair(vec![1, 2, 3], vec![30, 31, 32, 33]),
            pair(vec![10, 11, 12, 13, 14], vec![40, 41]),
        ];
        let batch = packing_collate(&items, 8, PAD);
        assert_eq!(batch.input_ids.len(), 16);
        assert_eq!(batch.segment_ids.len(), 16);
        assert_eq!(batch.packed_seq_lens, vec![3, 5, 4, 2]);
        assert_eq!(
            batch.segment_ids,
            vec![1, 1, 1, 2, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 0, 0]
        );
        assert_eq!(&batch.input_ids[14..], &[PAD, PAD]);
        // chosen in list order, then rejected in list order
        assert_eq!(&batch.input_ids[..3], &[1, 2, 3]);
        assert_eq!(&batch.input_ids[8..12], &[30, 31, 32, 33]);
    }

    #[test]
    fn test_packing_collate_no_alignment() {
        let items = vec![pair(vec![1, 2], vec![3])];
        let batch = packing_collate(&items, 1, PAD);
        assert_eq!(batch.input_ids, vec![1, 2, 3]);
        assert_eq!(batch.segment_ids, vec![1, 1, 2]);
        assert_eq!(batch.packed_seq_lens, vec![2, 1]);
        assert_eq!(batch.extras.len(), 1);
    }

    #[test]
    fn test_packing_collate_already_aligned() {
        let items = vec![pair(vec![1, 2], vec![3, 4])];
        let batch = packing_collate(&items, 4, PAD);
        assert_eq!(batch.input_ids.len(), 4);
        assert!(batch.segment_ids.iter().all(|&s| s != 0));
    }
}
