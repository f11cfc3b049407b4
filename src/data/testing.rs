//! Fixture writers shared by the data and application tests.

use std::fs;
use std::path::Path;

use image::{GrayImage, Luma, Rgb, RgbImage};

/// Minimal 8×8 VOC tree with the given `train` and `val` ids.
///
/// Every image is dark on the left half (class 0) and red on the
/// right half (class 15). The top mask row is the ignore label.
pub(crate) fn write_voc(root: &Path, train: &[&str], val: &[&str]) {
    let sets = root.join("ImageSets").join("Segmentation");
    fs::create_dir_all(&sets).unwrap();
    fs::create_dir_all(root.join("JPEGImages")).unwrap();
    fs::create_dir_all(root.join("SegmentationClassAug")).unwrap();
    fs::write(sets.join("trainaug.txt"), train.join("\n")).unwrap();
    // Trailing blank lines must be skipped by the reader.
    fs::write(sets.join("val.txt"), format!("{}\n\n", val.join("\n"))).unwrap();

    for id in train.iter().chain(val) {
        RgbImage::from_fn(8, 8, |x, _| if x < 4 { Rgb([20, 20, 20]) } else { Rgb([230, 40, 40]) })
            .save(root.join("JPEGImages").join(format!("{id}.jpg")))
            .unwrap();
        GrayImage::from_fn(8, 8, |x, y| Luma([if y == 0 { 255 } else if x < 4 { 0 } else { 15 }]))
            .save(root.join("SegmentationClassAug").join(format!("{id}.png")))
            .unwrap();
    }
}
