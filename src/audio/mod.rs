pub mod analysis;
pub mod context;
pub mod decode;
pub mod features;
pub mod fft;
pub mod onset;
pub mod sections;
pub mod spectral;
pub mod tempo;
