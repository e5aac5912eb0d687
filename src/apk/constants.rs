// Binary format constants that never change.
// For reserved paths and tunables, see defaults.rs

// Zip record signatures
pub const LOCAL_FILE_HEADER_SIG: u32 = 0x0403_4b50;
pub const CENTRAL_DIRECTORY_SIG: u32 = 0x0201_4b50;
pub const END_OF_CENTRAL_DIRECTORY_SIG: u32 = 0x0605_4b50;
pub const DATA_DESCRIPTOR_SIG: u32 = 0x0807_4b50;
pub const ZIP64_EOCD_LOCATOR_SIG: u32 = 0x0706_4b50;

// Fixed record sizes (without variable-length tails)
pub const LOCAL_FILE_HEADER_SIZE: usize = 30;
pub const CENTRAL_DIRECTORY_HEADER_SIZE: usize = 46;
pub const END_OF_CENTRAL_DIRECTORY_SIZE: usize = 22;
pub const MAX_ZIP_COMMENT_SIZE: usize = 0xffff;

// Compression methods
pub const METHOD_STORED: u16 = 0;
pub const METHOD_DEFLATED: u16 = 8;

// General purpose flags
pub const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;
pub const FLAG_UTF8: u16 = 0x0800;

// Extra field used by Android tooling to page-align stored entries
pub const ALIGNMENT_EXTRA_ID: u16 = 0xd935;
pub const ALIGNMENT_EXTRA_MIN_SIZE: usize = 6;

// Binary XML chunk types
pub const RES_STRING_POOL_TYPE: u16 = 0x0001;
pub const RES_XML_TYPE: u16 = 0x0003;
pub const RES_XML_START_NAMESPACE_TYPE: u16 = 0x0100;
pub const RES_XML_END_NAMESPACE_TYPE: u16 = 0x0101;
pub const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;
pub const RES_XML_END_ELEMENT_TYPE: u16 = 0x0103;
pub const RES_XML_CDATA_TYPE: u16 = 0x0104;
pub const RES_XML_RESOURCE_MAP_TYPE: u16 = 0x0180;

// String pool flags
pub const STRING_POOL_SORTED_FLAG: u32 = 1 << 0;
pub const STRING_POOL_UTF8_FLAG: u32 = 1 << 8;

// Res_value data types
pub const TYPE_REFERENCE: u8 = 0x01;
pub const TYPE_STRING: u8 = 0x03;
pub const TYPE_INT_DEC: u8 = 0x10;
pub const TYPE_INT_HEX: u8 = 0x11;
pub const TYPE_INT_BOOLEAN: u8 = 0x12;

pub const RES_VALUE_SIZE: u16 = 8;
pub const NO_INDEX: u32 = 0xffff_ffff;

// android:* attribute resource ids
pub const ATTR_NAME: u32 = 0x0101_0003;
pub const ATTR_DEBUGGABLE: u32 = 0x0101_000f;
pub const ATTR_VALUE: u32 = 0x0101_0024;
pub const ATTR_VERSION_CODE: u32 = 0x0101_021b;
pub const ATTR_MIN_SDK_VERSION: u32 = 0x0101_020c;
pub const ATTR_APP_COMPONENT_FACTORY: u32 = 0x0101_057a;
pub const ATTR_IS_SPLIT_REQUIRED: u32 = 0x0101_0591;

pub const ANDROID_NAMESPACE: &str = "http://schemas.android.com/apk/res/android";

// APK signing block
pub const APK_SIGNING_BLOCK_MAGIC: &[u8; 16] = b"APK Sig Block 42";
pub const APK_SIGNATURE_SCHEME_V2_BLOCK_ID: u32 = 0x7109_871a;
pub const APK_SIGNATURE_SCHEME_V3_BLOCK_ID: u32 = 0xf053_68c0;
pub const VERITY_PADDING_BLOCK_ID: u32 = 0x4272_6577;
pub const STRIPPING_PROTECTION_ATTR_ID: u32 = 0xbeef_f00d;

// Signature algorithm ids
pub const SIGNATURE_RSA_PKCS1_V1_5_WITH_SHA256: u32 = 0x0103;
pub const SIGNATURE_RSA_PKCS1_V1_5_WITH_SHA512: u32 = 0x0104;

// Content digest chunking
pub const CONTENT_DIGEST_CHUNK_SIZE: usize = 1024 * 1024;
pub const CHUNK_PREFIX: u8 = 0xa5;
pub const TOP_LEVEL_PREFIX: u8 = 0x5a;

// Scheme ids as written into stripping protection records
pub const SCHEME_ID_V2: u32 = 2;
pub const SCHEME_ID_V3: u32 = 3;
