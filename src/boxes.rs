// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

macro_rules! box_database {
    ($($boxenum:ident $boxtype:literal, $full:literal),*,) => {
        /// Box types this crate knows how to decode.
        ///
        /// Anything else ends up as `UnknownBox` and is skipped as opaque data.
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub enum BoxType {
            $($boxenum),*,
            UnknownBox(u32),
        }

        impl From<u32> for BoxType {
            fn from(t: u32) -> Self {
                use self::BoxType::*;
                match t {
                    $($boxtype => $boxenum),*,
                    _ => UnknownBox(t),
                }
            }
        }

        impl From<BoxType> for u32 {
            fn from(b: BoxType) -> Self {
                use self::BoxType::*;
                match b {
                    $($boxenum => $boxtype),*,
                    UnknownBox(t) => t,
                }
            }
        }

        impl BoxType {
            /// Whether the payload starts with a version+flags word.
            ///
            /// This is a property of the type, never inferred from the data.
            pub const fn is_full_box(self) -> bool {
                use self::BoxType::*;
                match self {
                    $($boxenum => $full),*,
                    UnknownBox(_) => false,
                }
            }
        }

        impl fmt::Debug for BoxType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let fourcc: FourCC = From::from(*self);
                fmt::Display::fmt(&fourcc, f)
            }
        }
    }
}

/// A four-character code.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct FourCC {
    pub value: [u8; 4],
}

impl FourCC {
    pub const fn new(value: &[u8; 4]) -> Self {
        Self { value: *value }
    }
}

impl From<u32> for FourCC {
    fn from(number: u32) -> Self {
        Self { value: number.to_be_bytes() }
    }
}

impl From<FourCC> for u32 {
    fn from(fourcc: FourCC) -> Self {
        Self::from_be_bytes(fourcc.value)
    }
}

impl From<BoxType> for FourCC {
    fn from(t: BoxType) -> Self {
        let box_num: u32 = Into::into(t);
        From::from(box_num)
    }
}

impl From<[u8; 4]> for FourCC {
    fn from(value: [u8; 4]) -> Self {
        Self { value }
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Non-ASCII codes show up in corrupt files, keep them readable
        for &b in &self.value {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl PartialEq<&[u8; 4]> for FourCC {
    fn eq(&self, other: &&[u8; 4]) -> bool {
        self.value.eq(*other)
    }
}

box_database!(
    FileTypeBox                       0x6674_7970, false, // "ftyp"
    MetadataBox                       0x6d65_7461, true,  // "meta"
    HandlerBox                        0x6864_6c72, true,  // "hdlr"
    PrimaryItemBox                    0x7069_746d, true,  // "pitm"
    ItemLocationBox                   0x696c_6f63, true,  // "iloc"
    ItemInfoBox                       0x6969_6e66, true,  // "iinf"
    ItemInfoEntry                     0x696e_6665, true,  // "infe"
    ImageReferenceBox                 0x6972_6566, true,  // "iref"
    ImagePropertiesBox                0x6970_7270, false, // "iprp"
    ItemPropertyContainerBox          0x6970_636f, false, // "ipco"
    ItemPropertyAssociationBox        0x6970_6d61, true,  // "ipma"
    ImageSpatialExtentsBox            0x6973_7065, true,  // "ispe"
    PixelInformationBox               0x7069_7869, true,  // "pixi"
    AuxiliaryTypeProperty             0x6175_7843, true,  // "auxC"
    UuidBox                           0x7575_6964, false, // "uuid"
);
