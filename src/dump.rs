// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Human-readable listing of a parsed box tree.

use std::fmt;

use crate::{BmffBox, BoxPayload, FourCC, TryString};

struct Bytes<'a>(&'a TryString);

impl fmt::Display for Bytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&std::string::String::from_utf8_lossy(self.0))
    }
}

struct Brands<'a>(&'a [FourCC]);

impl fmt::Display for Brands<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, brand) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{brand}")?;
        }
        Ok(())
    }
}

impl fmt::Display for BmffBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_box(self, f, 0)
    }
}

fn write_box(b: &BmffBox, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    let pad = depth * 2;
    macro_rules! out {
        ($($arg:tt)*) => {
            writeln!(f, "{:pad$}{}", "", format_args!($($arg)*))
        };
    }

    out!("Box: {} -----", b.type_string())?;
    out!("size: {}   (header size: {})", b.size(), b.header_size())?;
    if let Some(full) = b.full_header() {
        out!("version: {}", full.version)?;
        out!("flags: {:x}", full.flags)?;
    }

    match b.payload() {
        BoxPayload::Opaque | BoxPayload::Container => {},
        BoxPayload::FileType(ftyp) => {
            out!("major brand: {}", ftyp.major_brand)?;
            out!("minor version: {}", ftyp.minor_version)?;
            out!("compatible brands: {}", Brands(&ftyp.compatible_brands))?;
        },
        BoxPayload::Handler(hdlr) => {
            out!("pre_defined: {}", hdlr.pre_defined)?;
            out!("handler_type: {}", hdlr.handler_type)?;
            out!("name: {}", Bytes(&hdlr.name))?;
        },
        BoxPayload::PrimaryItem(pitm) => out!("item_ID: {}", pitm.item_id)?,
        BoxPayload::ItemLocation(iloc) => {
            for item in iloc.items.iter() {
                out!("item ID: {}", item.item_id)?;
                out!("  construction_method: {:?}", item.construction_method)?;
                out!("  data_reference_index: {:x}", item.data_reference_index)?;
                out!("  base_offset: {}", item.base_offset)?;
                let mut extents = std::string::String::new();
                for extent in item.extents.iter() {
                    extents.push_str(&format!("{},{} ", extent.offset, extent.length));
                }
                out!("  extents: {}", extents.trim_end())?;
            }
        },
        BoxPayload::ItemInfo(iinf) => out!("entry_count: {}", iinf.entry_count)?,
        BoxPayload::ItemInfoEntry(infe) => {
            out!("item_ID: {}", infe.item_id)?;
            out!("item_protection_index: {}", infe.item_protection_index)?;
            if let Some(item_type) = infe.item_type {
                out!("item_type: {item_type}")?;
            }
            out!("item_name: {}", Bytes(&infe.item_name))?;
            out!("content_type: {}", Bytes(&infe.content_type))?;
            out!("content_encoding: {}", Bytes(&infe.content_encoding))?;
            out!("item uri type: {}", Bytes(&infe.item_uri_type))?;
        },
        BoxPayload::ItemReference(iref) => {
            for reference in iref.references.iter() {
                out!(
                    "reference {}: {} -> {:?}",
                    reference.reference_type,
                    reference.from_item_id,
                    &*reference.to_item_ids
                )?;
            }
        },
        BoxPayload::ImageSpatialExtents(ispe) => {
            out!("image width: {}", ispe.width)?;
            out!("image height: {}", ispe.height)?;
        },
        BoxPayload::PropertyAssociation(ipma) => {
            for a in ipma.associations.iter() {
                let essential = if a.essential { " (essential)" } else { "" };
                out!("item {}: property {}{essential}", a.item_id, a.property_index)?;
            }
        },
        BoxPayload::PixelInformation(pixi) => out!("bits_per_channel: {:?}", &*pixi.bits_per_channel)?,
        BoxPayload::AuxiliaryType(auxc) => {
            out!("aux_type: {}", Bytes(&auxc.aux_type))?;
            out!("aux_subtype: {} bytes", auxc.aux_subtype.len())?;
        },
    }

    if let Some(err) = b.error() {
        out!("error: {err}")?;
    }

    for child in b.children() {
        write_box(child, f, depth + 1)?;
    }
    Ok(())
}
