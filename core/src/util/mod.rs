mod bitmap;

pub(crate) use self::bitmap::BitMap;
