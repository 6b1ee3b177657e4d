//! Erase engine: page lists, bank and mass erase.

use scroll::{Pread, LE};

use crate::constants::erase as sentinel;
use crate::controller::{Controller, Unlocked};
use crate::device::FlashGeometry;
use crate::error::{Error, Result};

/// Page count and page numbers are 16-bit.
const PAGE_FIELD_SIZE: usize = 2;

/// Which sentinel selected a full erase.
///
/// The controller only has one mass erase primitive, every selector ends up
/// there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MassSelector {
    Mass,
    Bank1,
    Bank2,
}

impl MassSelector {
    pub fn from_count(count: u16) -> Option<Self> {
        match count {
            sentinel::MASS => Some(MassSelector::Mass),
            sentinel::BANK1 => Some(MassSelector::Bank1),
            sentinel::BANK2 => Some(MassSelector::Bank2),
            _ => None,
        }
    }
}

/// A decoded erase request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EraseRequest {
    Mass(MassSelector),
    Pages(Vec<u16>),
}

impl EraseRequest {
    /// Decode `u16 count` followed by `count` little-endian page numbers.
    ///
    /// When the buffer holds fewer pages than announced, only the pages
    /// present are taken.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let count: u16 = data.pread_with(0, LE).map_err(|_| Error::RequestTooShort {
            len: data.len(),
            min: PAGE_FIELD_SIZE,
        })?;

        if let Some(selector) = MassSelector::from_count(count) {
            return Ok(EraseRequest::Mass(selector));
        }

        let available = (data.len() - PAGE_FIELD_SIZE) / PAGE_FIELD_SIZE;
        if available < usize::from(count) {
            log::warn!(
                "Erase request announces {} pages but carries {}",
                count,
                available
            );
        }

        let mut offset = PAGE_FIELD_SIZE;
        let mut pages = Vec::with_capacity(available.min(count.into()));
        for _ in 0..available.min(count.into()) {
            let page: u16 = data.gread_with(&mut offset, LE).map_err(|_| Error::RequestTooShort {
                len: data.len(),
                min: offset + PAGE_FIELD_SIZE,
            })?;
            pages.push(page);
        }
        Ok(EraseRequest::Pages(pages))
    }
}

/// Erase as requested by a raw erase payload.
pub fn erase(controller: &mut dyn Controller, geometry: &FlashGeometry, data: &[u8]) -> Result<()> {
    match EraseRequest::parse(data)? {
        EraseRequest::Mass(selector) => {
            log::debug!("Full erase requested via {:?}", selector);
            mass_erase(controller, data)
        }
        EraseRequest::Pages(pages) => erase_pages(controller, geometry, &pages),
    }
}

/// Erase the whole flash.
///
/// The options buffer must hold at least the two selector bytes. Their
/// value is not looked at.
pub fn mass_erase(controller: &mut dyn Controller, data: &[u8]) -> Result<()> {
    if data.len() < PAGE_FIELD_SIZE {
        return Err(Error::RequestTooShort {
            len: data.len(),
            min: PAGE_FIELD_SIZE,
        });
    }

    let mut flash = Unlocked::new(controller);
    flash.clear_errors();
    flash
        .mass_erase()
        .map_err(|status| Error::Erase { status })?;

    log::info!("Flash mass erased");
    Ok(())
}

/// Erase single pages.
///
/// All pages are checked against the last page index before anything is
/// erased. A page the controller fails to erase does not stop the others;
/// the failures are reported together at the end.
pub fn erase_pages(controller: &mut dyn Controller, geometry: &FlashGeometry, pages: &[u16]) -> Result<()> {
    if let Some(&page) = pages.iter().find(|&&page| page > geometry.max_page) {
        return Err(Error::PageOutOfRange {
            page,
            max: geometry.max_page,
        });
    }

    let mut failed = 0;
    {
        let mut flash = Unlocked::new(controller);
        flash.clear_errors();
        for &page in pages {
            if let Err(status) = flash.erase_page(page) {
                log::warn!("Erasing page {} failed: {:?}", page, status);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(Error::PagesFailed {
            failed,
            total: pages.len(),
        });
    }
    log::info!("Erased {} pages", pages.len());
    Ok(())
}
