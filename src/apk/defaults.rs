// Centralized defaults: reserved archive paths, alignment, identity parameters

// =================================
// Reserved loader paths
// =================================
pub const ASSET_ROOT: &str = "assets/lspatch/";
pub const LOADER_DEX_ASSET: &str = "assets/lspatch/loader.dex";
pub const CONFIG_ASSET: &str = "assets/lspatch/config.json";
pub const ORIGIN_APK_ASSET: &str = "assets/lspatch/origin.apk";
pub const MODULES_ASSET_DIR: &str = "assets/lspatch/modules/";
pub const NATIVE_LIB_ASSET_DIR: &str = "assets/lspatch/so/";
pub const NATIVE_LIB_NAME: &str = "liblspatch.so";

// Payload file names inside the loader directory
pub const PAYLOAD_LOADER_DEX: &str = "loader.dex";
pub const PAYLOAD_BOOTSTRAP_DEX: &str = "metaloader.dex";
pub const PAYLOAD_NATIVE_DIR: &str = "so";

pub const SUPPORTED_ABIS: &[&str] = &["armeabi-v7a", "arm64-v8a", "x86", "x86_64"];

// Class the rewritten appComponentFactory points at
pub const BOOTSTRAP_CLASS: &str = "org.lsposed.lspatch.metaloader.LSPAppComponentFactoryStub";

// =================================
// Manifest keys
// =================================
pub const MARKER_META_KEY: &str = "lspatch";
pub const MODULE_MIN_VERSION_KEY: &str = "xposedminversion";
pub const MODULE_PROP_ENTRY: &str = "META-INF/xposed/module.prop";
pub const MODULE_PROP_MIN_API: &str = "minApiVersion";

pub const SOURCE_STAMP_META_KEYS: &[&str] = &["com.android.stamp.source", "com.android.stamp.type"];
pub const SOURCE_STAMP_ENTRY: &str = "stamp-cert-sha256";
pub const SPLIT_REQUIRED_META_KEYS: &[&str] =
    &["com.android.vending.splits.required", "com.android.vending.splits"];
pub const SPLIT_REQUIRED_ATTR: &str = "isSplitRequired";
pub const REQUIRED_SPLIT_TYPES_ATTR: &str = "requiredSplitTypes";

pub const MANIFEST_ENTRY: &str = "AndroidManifest.xml";

// =================================
// Archive layout
// =================================
pub const STORED_ALIGNMENT: usize = 4;
pub const PAGE_ALIGNMENT: usize = 4096;
pub const SIGNING_BLOCK_ALIGNMENT: usize = 4096;

// 1981-01-01 00:00:00 in MS-DOS format, as written by aapt2 and apksigner
pub const DOS_EPOCH_DATE: u16 = 0x0221;
pub const DOS_EPOCH_TIME: u16 = 0x0000;

pub const OUTPUT_SUFFIX: &str = "-lspatched.apk";

// =================================
// Signing
// =================================
pub const V1_SIGNER_NAME: &str = "LSPATCH";
pub const V1_CREATED_BY: &str = "1.0 (Android)";
pub const V3_MIN_SDK: u32 = 28;
pub const V3_MAX_SDK: u32 = 0x7fff_ffff;
pub const SHA512_KEY_THRESHOLD_BITS: usize = 3072;

pub const DEFAULT_IDENTITY_FILE: &str = "identity.pem";
pub const DEFAULT_IDENTITY_SUBJECT: &str = "CN=LSPatch,O=LSPosed,C=US";
pub const DEFAULT_KEY_BITS: usize = 2048;
pub const DEFAULT_IDENTITY_VALIDITY_SECS: u64 = 25 * 365 * 24 * 60 * 60;

// =================================
// Environment
// =================================
pub const LOADER_DIR_ENV: &str = "LSPATCH_LOADER_DIR";
pub const HOME_ENV: &str = "LSPATCH_HOME";
pub const DEFAULT_HOME_SUBDIR: &str = ".config/lspatch";
