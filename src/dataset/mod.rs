pub mod loader;
pub mod split;
pub mod validator;

pub use loader::{
    decode_image_bytes, image_to_pixels, load_image_pixels, BatchStream, ImageBatch, ImageBatcher,
    ImageItem, StreamOptions,
};
pub use split::{
    shuffle_buffered, DatasetSplits, LabeledImageSet, Sample, Split, SplitConfig, SplitKind,
};
pub use validator::{inspect_file, validate_and_clean, FileOutcome, ValidationReport, IMAGE_EXTENSIONS};
