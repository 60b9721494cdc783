use std::path::Path;

use ndarray::{Array3, Axis, Ix3};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use super::{Volume, VolumeError};

/// Reads a `.nii` / `.nii.gz` file as a float volume. Trailing singleton
/// dimensions (e.g. a one-frame 4D file) are dropped.
pub fn read_nifti(path: &Path) -> Result<Volume, VolumeError> {
    let obj = ReaderOptions::new().read_file(path)?;
    let pixdim = obj.header().pixdim;

    let mut data = obj.into_volume().into_ndarray::<f32>()?;
    while data.ndim() > 3 && data.shape()[data.ndim() - 1] == 1 {
        let last = data.ndim() - 1;
        data = data.index_axis_move(Axis(last), 0);
    }
    let ndim = data.ndim();
    let data = data
        .into_dimensionality::<Ix3>()
        .map_err(|_| VolumeError::Dimensionality { ndim })?;

    // The reader yields a Fortran-ordered view; keep everything downstream
    // in standard layout.
    let data: Array3<f32> = data.as_standard_layout().into_owned();

    let spacing = [pixdim[1], pixdim[2], pixdim[3]].map(|s| if s > 0.0 { s } else { 1.0 });

    Ok(Volume::new(data, spacing))
}

/// Writes a float volume. Compression follows the file extension.
pub fn write_nifti(volume: &Volume, path: &Path) -> Result<(), VolumeError> {
    let mut header = NiftiHeader::default();
    let [_, px, py, pz, ..] = &mut header.pixdim;
    (*px, *py, *pz) = (volume.spacing[0], volume.spacing[1], volume.spacing[2]);

    WriterOptions::new(path)
        .reference_header(&header)
        .write_nifti(&volume.data)?;

    Ok(())
}
