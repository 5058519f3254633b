//! 样本编码：定长、相差一步的 input / target

use titling::{SampleEncoder, TitlingError, TrainingExample, utils::argmax};

mod common;

fn encoder(max_len: usize) -> SampleEncoder {
    SampleEncoder::new(common::cat_dog_vocab(), max_len, 2).unwrap()
}

#[test]
fn test_cat_dog_cat_example() {
    let sample = encoder(6)
        .encode(&common::example("cat dog cat", 1, 0.3))
        .unwrap();

    assert_eq!(sample.input_ids, vec![0, 4, 5, 4, 1, 1]);
    assert_eq!(sample.targets.dim(), (6, 6));
    assert_eq!(sample.category.to_vec(), vec![0.0, 1.0]);

    let argmaxes: Vec<usize> = sample.targets.rows().into_iter().map(argmax).collect();
    assert_eq!(argmaxes, vec![4, 5, 4, 3, 0, 0]);

    // 真实位置是 one-hot，填充位置全零
    for t in 0..4 {
        assert_eq!(sample.targets.row(t).sum(), 1.0);
    }
    assert_eq!(sample.targets.row(4).sum(), 0.0);
    assert_eq!(sample.targets.row(5).sum(), 0.0);
}

#[test]
fn test_lengths_always_match_max_len() {
    let titles = ["", "cat", "cat dog cat dog cat dog cat dog", "a b c"];
    for max_len in 1..8 {
        let encoder = encoder(max_len);
        for title in titles {
            let sample = encoder.encode(&common::example(title, 0, 0.0)).unwrap();
            assert_eq!(sample.input_ids.len(), max_len);
            assert_eq!(sample.targets.nrows(), max_len);

            // 最后一个真实位置的目标是 END
            let (input, target) = encoder.encode_title(title);
            assert_eq!(input[0], 0);
            let last_real = target.iter().rposition(Option::is_some).unwrap();
            assert_eq!(target[last_real], Some(3));
        }
    }
}

#[test]
fn test_targets_are_shifted_inputs() {
    let encoder = encoder(5);
    let (input, target) = encoder.encode_title("dog cat");
    assert_eq!(input, vec![0, 5, 4, 1, 1]);
    assert_eq!(target, vec![Some(5), Some(4), Some(3), None, None]);
    assert_eq!(encoder.canonical_sequence("dog cat"), vec![0, 5, 4, 3]);
}

#[test]
fn test_empty_title_is_start_then_end() {
    let (input, target) = encoder(3).encode_title("");
    assert_eq!(input, vec![0, 1, 1]);
    assert_eq!(target, vec![Some(3), None, None]);
}

#[test]
fn test_invalid_category_rejected() {
    let result = encoder(4).encode(&TrainingExample {
        image: common::image(0.0),
        category: 2,
        title: "cat".to_string(),
    });
    assert!(matches!(
        result,
        Err(TitlingError::InvalidCategory {
            category: 2,
            num_categories: 2
        })
    ));
}
