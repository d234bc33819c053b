pub mod generation_mix;
pub mod generation_mix_archive;
pub mod lib_neso;
