pub mod bottleneck;
pub mod conv_bn;
