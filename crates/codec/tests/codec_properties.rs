use codec::Codec;
use proptest::prelude::*;

proptest! {
    #[test]
    fn compress_decompress_round_trips(data in proptest::collection::vec(any::<u8>(), 0..8192)) {
        let codec = Codec::default();
        let compressed = codec.compress(&data).unwrap();
        let back = codec.decompress(&compressed).unwrap();
        prop_assert_eq!(back, data);
    }

    #[test]
    fn levels_produce_equivalent_plaintext(data in proptest::collection::vec(any::<u8>(), 0..4096), level in 1i32..10) {
        let writer = Codec::new(level);
        let reader = Codec::default();
        let compressed = writer.compress(&data).unwrap();
        prop_assert_eq!(reader.decompress(&compressed).unwrap(), data);
    }
}
