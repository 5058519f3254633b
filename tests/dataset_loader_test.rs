// 帖子数据集与按需加载图像的样本源

use std::sync::Arc;

use titling::{
    BatchGenerator, ExampleSource, InMemoryImages, SampleEncoder, TitlingError,
    batch_generator::PostSource,
    dataset_loader::{Post, PostsFile},
};

mod common;

const POSTS_JSON: &str = r#"{
  "posts": [
    { "path": "img/a.jpg", "subreddit": 0, "title": "Cat on a sofa" },
    { "path": "img/b.jpg", "subreddit": 1, "title": "Dog in the park" },
    { "path": "img/c.jpg", "subreddit": 1, "title": "Another dog" }
  ],
  "subreddit_indices_map": { "cats": 0, "dogs": 1 }
}"#;

#[test]
fn test_load_posts_file_with_limit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("posts.json");
    std::fs::write(&path, POSTS_JSON).unwrap();

    let all = PostsFile::load(&path, None).unwrap();
    assert_eq!(all.posts.len(), 3);
    assert_eq!(all.posts[1].subreddit, 1);
    assert_eq!(all.category_name(1), Some("dogs"));
    assert_eq!(all.category_name(7), None);
    assert_eq!(all.category_names().get(&0).map(String::as_str), Some("cats"));
    assert_eq!(all.titles(), vec!["Cat on a sofa", "Dog in the park", "Another dog"]);

    let limited = PostsFile::load(&path, Some(2)).unwrap();
    assert_eq!(limited.posts.len(), 2);
}

#[test]
fn test_category_map_is_optional_and_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("posts.json");
    std::fs::write(
        &path,
        r#"{ "posts": [{ "path": "x.png", "subreddit": 2, "title": "hello" }] }"#,
    )
    .unwrap();

    let file = PostsFile::load(&path, None).unwrap();
    assert!(file.subreddit_indices_map.is_empty());

    let copy = dir.path().join("copy.json");
    file.save(&copy).unwrap();
    assert_eq!(PostsFile::load(&copy, None).unwrap(), file);
}

#[test]
fn test_malformed_posts_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.json");
    std::fs::write(&path, r#"{ "posts": [{ "path": 3 }] }"#).unwrap();
    assert!(matches!(PostsFile::load(&path, None), Err(TitlingError::Json(_))));
    assert!(matches!(
        PostsFile::load(dir.path().join("missing.json"), None),
        Err(TitlingError::Io(_))
    ));
}

#[test]
fn test_post_source_feeds_batch_generator() {
    let posts = vec![
        Post {
            path: "a.png".into(),
            subreddit: 0,
            title: "cat".to_string(),
        },
        Post {
            path: "b.png".into(),
            subreddit: 1,
            title: "dog dog".to_string(),
        },
    ];
    let mut images = InMemoryImages::new();
    images.insert("a.png", common::image(0.1));
    images.insert("b.png", common::image(0.9));

    let source = PostSource::new(posts, images);
    assert_eq!(source.len(), 2);
    assert_eq!(source.example(1).unwrap().title, "dog dog");

    let encoder = SampleEncoder::new(common::cat_dog_vocab(), 4, 2).unwrap();
    let generator = BatchGenerator::new(source, encoder, 2, false, None).unwrap();
    let batch = generator.batch(0).unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch.input_ids.row(1).to_vec(), vec![0, 5, 5, 1]);
    assert_eq!(batch.categories.row(1).to_vec(), vec![0.0, 1.0]);
}

#[test]
fn test_missing_image_is_reported() {
    let source = PostSource::new(
        vec![Post {
            path: "nowhere.png".into(),
            subreddit: 0,
            title: "cat".to_string(),
        }],
        InMemoryImages::new(),
    );
    assert!(matches!(
        source.example(0),
        Err(TitlingError::ImageLoad { .. })
    ));

    let encoder = SampleEncoder::new(Arc::new(titling::Vocab::new(["cat"])), 3, 1).unwrap();
    let generator = BatchGenerator::new(source, encoder, 1, false, None).unwrap();
    assert!(generator.batch(0).is_err());
}
