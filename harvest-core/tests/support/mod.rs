#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use async_trait::async_trait;

use harvest_core::portal::{
    PortalError, PortalResult, PortalSession, RowSnapshot, SessionCookie, SessionFactory,
    SessionSpec,
};
use harvest_core::{Direction, ListingSelectors, DOWNLOAD_ACTION};

pub const STAGING_FILE: &str = "TransferManifest.pdf";

/// Scripted portal: each direction's grid is a list of pages of row keys.
#[derive(Default)]
pub struct PortalState {
    pub grids: HashMap<Direction, Vec<Vec<String>>>,
    pub calls: Vec<String>,
    pub cookies: Vec<SessionCookie>,
    pub typed: Vec<(String, String)>,
    pub menu: Vec<RowSnapshot>,
    pub fail_on: Option<String>,
    pub fail_open: bool,
    pub download_clicks: usize,
    pub next_clicks: usize,
    pub last_page_checks: usize,
    /// Page total shown by the pager, when it disagrees with the grid.
    pub reported_total: Option<usize>,
    pub opened: Vec<SessionSpec>,
    pub profile_was_empty: Vec<bool>,
    pub closed: usize,
}

pub type SharedState = Rc<RefCell<PortalState>>;

pub fn pages(pages: &[&[&str]]) -> Vec<Vec<String>> {
    pages
        .iter()
        .map(|page| page.iter().map(|key| key.to_string()).collect())
        .collect()
}

pub fn shared(grids: Vec<(Direction, Vec<Vec<String>>)>) -> SharedState {
    Rc::new(RefCell::new(PortalState {
        grids: grids.into_iter().collect(),
        ..Default::default()
    }))
}

/// Counters and logs live in the shared state; the grid position is per
/// session so concurrent sessions do not disturb each other.
pub struct MockPortal {
    state: SharedState,
    download_dir: PathBuf,
    active: Option<Direction>,
    page: usize,
    selected: Option<String>,
    closed: bool,
}

impl MockPortal {
    pub fn new(state: SharedState, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            state,
            download_dir: download_dir.into(),
            active: None,
            page: 0,
            selected: None,
            closed: false,
        }
    }

    fn record(&self, call: String) -> PortalResult<()> {
        let mut state = self.state.borrow_mut();
        let failing = state
            .fail_on
            .as_deref()
            .map(|target| call.ends_with(target))
            .unwrap_or(false);
        state.calls.push(call.clone());
        if failing {
            return Err(PortalError::ElementNotFound(call));
        }
        Ok(())
    }

    fn active_selectors(&self) -> Option<ListingSelectors> {
        self.active.map(ListingSelectors::for_direction)
    }

    fn current_page(&self) -> Vec<String> {
        let state = self.state.borrow();
        self.active
            .and_then(|direction| state.grids.get(&direction))
            .and_then(|pages| pages.get(self.page))
            .cloned()
            .unwrap_or_default()
    }

    fn page_count(&self) -> usize {
        let state = self.state.borrow();
        self.active
            .and_then(|direction| state.grids.get(&direction))
            .map(|pages| pages.len().max(1))
            .unwrap_or(1)
    }
}

#[async_trait(?Send)]
impl PortalSession for MockPortal {
    async fn goto(&mut self, url: &str) -> PortalResult<()> {
        self.record(format!("goto {url}"))
    }

    async fn wait_for_idle(&mut self) -> PortalResult<()> {
        Ok(())
    }

    async fn wait_for(&mut self, selector: &str) -> PortalResult<()> {
        self.record(format!("wait_for {selector}"))
    }

    async fn click(&mut self, selector: &str) -> PortalResult<()> {
        self.record(format!("click {selector}"))?;
        for direction in Direction::ALL {
            if selector == ListingSelectors::for_direction(direction).tab {
                self.active = Some(direction);
                self.page = 0;
                return Ok(());
            }
        }
        if selector == DOWNLOAD_ACTION {
            self.state.borrow_mut().download_clicks += 1;
            let key = self
                .selected
                .clone()
                .ok_or_else(|| PortalError::UnexpectedShape("no row selected".into()))?;
            std::fs::write(
                self.download_dir.join(STAGING_FILE),
                format!("manifest:{key}"),
            )?;
            return Ok(());
        }
        if let Some(selectors) = self.active_selectors() {
            if selector == selectors.next_page {
                self.state.borrow_mut().next_clicks += 1;
                self.page += 1;
            }
        }
        Ok(())
    }

    async fn click_nth(&mut self, selector: &str, index: usize) -> PortalResult<()> {
        self.record(format!("click_nth {index} {selector}"))?;
        let key = self
            .current_page()
            .get(index)
            .cloned()
            .ok_or_else(|| PortalError::ElementNotFound(format!("{selector}[{index}]")))?;
        self.selected = Some(key);
        Ok(())
    }

    async fn type_text(&mut self, selector: &str, text: &str) -> PortalResult<()> {
        self.record(format!("type {selector}"))?;
        self.state
            .borrow_mut()
            .typed
            .push((selector.to_string(), text.to_string()));
        Ok(())
    }

    async fn read_text(&mut self, selector: &str) -> PortalResult<String> {
        self.record(format!("read_text {selector}"))?;
        let total = self
            .state
            .borrow()
            .reported_total
            .unwrap_or_else(|| self.page_count());
        Ok(format!("Page 1 of {total}"))
    }

    async fn select_option(&mut self, selector: &str, value: &str) -> PortalResult<()> {
        self.record(format!("select {value} {selector}"))
    }

    async fn query_all(&mut self, selector: &str) -> PortalResult<Vec<RowSnapshot>> {
        self.record(format!("query_all {selector}"))?;
        if let Some(selectors) = self.active_selectors() {
            if selector == selectors.rows {
                return Ok(self
                    .current_page()
                    .into_iter()
                    .enumerate()
                    .map(|(index, key)| RowSnapshot {
                        index,
                        text: key.clone(),
                        cells: vec![String::new(), key, "Accepted".to_string()],
                        link: None,
                    })
                    .collect());
            }
        }
        Ok(self.state.borrow().menu.clone())
    }

    async fn exists(&mut self, selector: &str) -> PortalResult<bool> {
        self.record(format!("exists {selector}"))?;
        let on_last_page = self.page + 1 >= self.page_count();
        match self.active_selectors() {
            Some(selectors) if selector == selectors.next_page_disabled && on_last_page => {
                self.state.borrow_mut().last_page_checks += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn scroll_to_bottom(&mut self) -> PortalResult<()> {
        Ok(())
    }

    async fn cookies(&mut self) -> PortalResult<Vec<SessionCookie>> {
        self.record("cookies".to_string())?;
        Ok(self.state.borrow().cookies.clone())
    }

    async fn set_cookies(&mut self, cookies: &[SessionCookie]) -> PortalResult<()> {
        self.record("set_cookies".to_string())?;
        self.state.borrow_mut().cookies = cookies.to_vec();
        Ok(())
    }

    async fn close(&mut self) -> PortalResult<()> {
        if !self.closed {
            self.closed = true;
            let mut state = self.state.borrow_mut();
            state.closed += 1;
            state.calls.push("close".to_string());
        }
        Ok(())
    }
}

pub struct MockFactory {
    pub state: SharedState,
}

#[async_trait(?Send)]
impl SessionFactory for MockFactory {
    async fn open(&self, spec: &SessionSpec) -> PortalResult<Box<dyn PortalSession>> {
        let empty = std::fs::read_dir(&spec.profile_dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        let mut state = self.state.borrow_mut();
        state.opened.push(spec.clone());
        state.profile_was_empty.push(empty);
        if state.fail_open {
            return Err(PortalError::Launch("browser crashed on start".into()));
        }
        let download_dir = spec
            .download_dir
            .clone()
            .unwrap_or_else(|| spec.profile_dir.clone());
        Ok(Box::new(MockPortal::new(self.state.clone(), download_dir)))
    }
}
