//! macOS window source.
//!
//! Enumerates windows with `CGWindowListCopyWindowInfo` and raises them
//! through the Accessibility API.

use crate::{PlatformError, TargetApp, WindowSource};
use backtick_core_order::{WindowId, WindowSnapshot};
use objc2_app_kit::{NSApplicationActivationOptions, NSRunningApplication};
use objc2_application_services::{
    AXError, AXIsProcessTrusted, AXIsProcessTrustedWithOptions, AXUIElement,
};
use objc2_core_foundation::{
    CFArray, CFBoolean, CFDictionary, CFNumber, CFNumberType, CFRetained, CFString, CFType,
};
use objc2_core_graphics::{kCGNullWindowID, CGWindowListCopyWindowInfo, CGWindowListOption};
use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use tracing::{debug, warn};

/// Normal application windows live on layer 0.
const NORMAL_WINDOW_LAYER: i64 = 0;

/// One entry of the CoreGraphics window list.
#[derive(Debug, Clone)]
struct RawWindow {
    id: WindowId,
    pid: i32,
    owner: String,
    title: String,
    layer: i64,
}

/// Window source backed by CoreGraphics and Accessibility.
#[derive(Debug)]
pub struct MacWindowSource {
    target: TargetApp,
}

impl MacWindowSource {
    /// Create a source for the given target application.
    pub fn new(target: TargetApp) -> Self {
        Self { target }
    }
}

impl WindowSource for MacWindowSource {
    fn list_windows(&self) -> Vec<WindowSnapshot> {
        if !self.has_permission() {
            debug!("Accessibility permission missing, reporting no windows");
            return Vec::new();
        }

        objc2::rc::autoreleasepool(|_pool| {
            let raw = copy_window_list(
                CGWindowListOption::OptionOnScreenOnly | CGWindowListOption::ExcludeDesktopElements,
            );

            // Window list is front-to-back, so the first normal window of an
            // active application is the focused one.
            let mut app_active: HashMap<i32, bool> = HashMap::new();
            let mut focused_pid_seen = false;
            let mut windows = Vec::new();

            for window in raw {
                if window.layer != NORMAL_WINDOW_LAYER {
                    continue;
                }

                let is_active_app = *app_active
                    .entry(window.pid)
                    .or_insert_with(|| is_app_active(window.pid));
                let is_focused = is_active_app && !focused_pid_seen;
                if is_focused {
                    focused_pid_seen = true;
                }

                if !self.target.matches(&window.owner, &window.title) {
                    continue;
                }

                windows.push(WindowSnapshot::new(window.id, window.title, is_focused));
            }

            windows
        })
    }

    fn activate(&self, id: WindowId) -> Result<(), PlatformError> {
        objc2::rc::autoreleasepool(|_pool| {
            let window = copy_window_list(CGWindowListOption::OptionAll)
                .into_iter()
                .find(|w| w.id == id)
                .ok_or(PlatformError::WindowNotFound(id))?;

            let app = NSRunningApplication::runningApplicationWithProcessIdentifier(window.pid)
                .ok_or_else(|| PlatformError::ActivationFailed {
                    id,
                    reason: format!("no running application for pid {}", window.pid),
                })?;

            #[allow(deprecated)]
            let activated =
                app.activateWithOptions(NSApplicationActivationOptions::ActivateIgnoringOtherApps);
            if !activated {
                warn!("Application {} refused activation", window.pid);
            }

            raise_ax_window(window.pid, &window.title).map_err(|reason| {
                PlatformError::ActivationFailed { id, reason }
            })
        })
    }

    fn has_permission(&self) -> bool {
        unsafe { AXIsProcessTrusted() }
    }

    fn request_permission(&self) {
        let key = CFString::from_static_str("AXTrustedCheckOptionPrompt");
        let value = CFBoolean::new(true);
        let options = CFDictionary::<CFString, CFBoolean>::from_slices(&[&*key], &[value]);
        let trusted = unsafe { AXIsProcessTrustedWithOptions(Some(options.as_opaque())) };
        debug!("Permission prompt requested (trusted: {})", trusted);
    }
}

/// Copy the CoreGraphics window list.
fn copy_window_list(option: CGWindowListOption) -> Vec<RawWindow> {
    let Some(list) = CGWindowListCopyWindowInfo(option, kCGNullWindowID) else {
        return Vec::new();
    };

    let count = CFArray::count(&list);
    let mut windows = Vec::with_capacity(usize::try_from(count).unwrap_or(0));

    for idx in 0..count {
        let ptr = unsafe { CFArray::value_at_index(&list, idx).cast::<CFDictionary>() };
        if ptr.is_null() {
            continue;
        }
        let dict = unsafe { &*ptr };

        let Some(id) = dict_number(dict, "kCGWindowNumber") else {
            continue;
        };
        let Some(pid) = dict_number(dict, "kCGWindowOwnerPID") else {
            continue;
        };

        windows.push(RawWindow {
            id: id as WindowId,
            pid: pid as i32,
            owner: dict_string(dict, "kCGWindowOwnerName"),
            title: dict_string(dict, "kCGWindowName"),
            layer: dict_number(dict, "kCGWindowLayer").unwrap_or(NORMAL_WINDOW_LAYER),
        });
    }

    windows
}

fn dict_value(dict: &CFDictionary, key: &str) -> Option<*const c_void> {
    let key = CFString::from_str(key);
    let key_ref = (&*key as *const CFString).cast::<c_void>();
    unsafe {
        if CFDictionary::contains_ptr_key(dict, key_ref) {
            Some(CFDictionary::value(dict, key_ref))
        } else {
            None
        }
    }
}

fn dict_number(dict: &CFDictionary, key: &str) -> Option<i64> {
    let number = dict_value(dict, key)?.cast::<CFNumber>();
    if number.is_null() {
        return None;
    }
    let mut value: i64 = 0;
    let ok = unsafe {
        CFNumber::value(
            &*number,
            CFNumberType::SInt64Type,
            (&mut value as *mut i64).cast::<c_void>(),
        )
    };
    ok.then_some(value)
}

fn dict_string(dict: &CFDictionary, key: &str) -> String {
    match dict_value(dict, key) {
        Some(ptr) if !ptr.is_null() => unsafe { (*ptr.cast::<CFString>()).to_string() },
        _ => String::new(),
    }
}

fn is_app_active(pid: i32) -> bool {
    NSRunningApplication::runningApplicationWithProcessIdentifier(pid)
        .map(|app| app.isActive())
        .unwrap_or(false)
}

fn copy_attribute(element: &AXUIElement, name: &'static str) -> Option<CFRetained<CFType>> {
    let attr = CFString::from_static_str(name);
    let mut value: *const CFType = std::ptr::null();
    let result = unsafe { element.copy_attribute_value(&attr, NonNull::from(&mut value)) };
    if result != AXError::Success || value.is_null() {
        return None;
    }
    Some(unsafe { CFRetained::from_raw(NonNull::new_unchecked(value.cast_mut())) })
}

fn element_title(element: &AXUIElement) -> Option<String> {
    copy_attribute(element, "AXTitle")?
        .downcast_ref::<CFString>()
        .map(|s| s.to_string())
}

/// Raise the application's window whose title matches, falling back to its first window.
fn raise_ax_window(pid: i32, title: &str) -> Result<(), String> {
    let app = unsafe { AXUIElement::new_application(pid) };
    let windows = copy_attribute(&app, "AXWindows")
        .ok_or_else(|| "application exposes no accessibility windows".to_string())?;
    let windows = windows
        .downcast_ref::<CFArray>()
        .ok_or_else(|| "unexpected AXWindows value".to_string())?;

    let count = CFArray::count(windows);
    let mut first: Option<&AXUIElement> = None;
    let mut matched: Option<&AXUIElement> = None;

    for idx in 0..count {
        let ptr = unsafe { CFArray::value_at_index(windows, idx).cast::<AXUIElement>() };
        if ptr.is_null() {
            continue;
        }
        let element = unsafe { &*ptr };
        first.get_or_insert(element);
        if !title.is_empty() && element_title(element).as_deref() == Some(title) {
            matched = Some(element);
            break;
        }
    }

    let element = matched
        .or(first)
        .ok_or_else(|| "application has no windows".to_string())?;

    let main_attr = CFString::from_static_str("AXMain");
    let raise_action = CFString::from_static_str("AXRaise");
    unsafe {
        let main_result = element.set_attribute_value(&main_attr, CFBoolean::new(true));
        if main_result != AXError::Success {
            debug!("Setting AXMain failed for pid {}: {:?}", pid, main_result);
        }
        let raise_result = element.perform_action(&raise_action);
        if raise_result != AXError::Success {
            return Err(format!("AXRaise failed: {:?}", raise_result));
        }
    }

    Ok(())
}
