/// Extensions decoded by the `image` crate directly.
pub const GENERIC_EXTENSIONS: [&str; 11] = [
	"jpg", "jpeg", "jfif", "png", "gif", "bmp", "tif", "tiff", "webp", "ico", "tga",
];

/// Camera formats listed in the library but never decoded, they are only ever sent as is.
pub const PASSTHROUGH_EXTENSIONS: [&str; 11] = [
	"heic", "heif", "avif", "dng", "cr2", "cr3", "nef", "arw", "raf", "orf", "rw2",
];

/// Renditions are always re-encoded to a single format, regardless of the source.
pub const RENDITION_EXTENSION: &str = "jpg";

pub const RENDITION_MIME: &str = "image/jpeg";

/// Largest source file, in bytes, a rendition is generated from.
pub const MAXIMUM_FILE_SIZE: u64 = MIB * 192;

/// The size of 1MiB in bytes
const MIB: u64 = 1_048_576;
